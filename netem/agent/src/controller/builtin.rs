//! Builtin controller: drives the kernel's prio/netem qdiscs via tc.
//!
//! The root of the interface is a `prio` qdisc whose first two bands
//! carry unclassified traffic untouched. Every driven profile owns one
//! band >= 3, reached through a fw filter keyed on the profile's mark and
//! ending in a netem leaf qdisc with the profile's impairment parameters.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use netem_crd::ControllerKind;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::{
    emitter::Emitter,
    error::{AgentError, AgentResult},
    profile::ProfileHandle,
};

use super::{ImpairmentController, MarkPool, ProfileRegistry};

/// Bands reserved for profiles when the root qdisc is first created.
const INITIAL_BANDS: u16 = 8;

/// Bands added per resize once the pool runs dry.
const EXTRA_BANDS: u16 = 8;

/// Packet limit applied when the profile does not set one.
const DEFAULT_LIMIT: u32 = 20000;

/// The `netem` block of a Builtin profile's parameters.
///
/// Ratios are fractions of one, delays are seconds, the rate is kbit/s.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetemParams {
    pub loss_ratio: f64,
    pub loss_correlation: f64,
    pub duplication_ratio: f64,
    pub duplication_correlation: f64,
    pub delay: f64,
    pub jitter: f64,
    pub delay_jitter_correlation: f64,
    pub reorder_ratio: f64,
    pub reorder_correlation: f64,
    pub reorder_gap: u32,
    pub distribution: String,
    pub limit: u32,
    pub rate: u64,
    pub rate_packetoverhead: i64,
    pub rate_cellsize: u64,
    pub rate_celloverhead: i64,
    pub slot_min_delay: f64,
    pub slot_max_delay: f64,
    pub slot_distribution: String,
    pub slot_delay: f64,
    pub slot_jitter: f64,
    pub slot_packets: u32,
    pub slot_bytes: u64,
}

impl Default for NetemParams {
    fn default() -> Self {
        Self {
            loss_ratio: 0.0,
            loss_correlation: 0.0,
            duplication_ratio: 0.0,
            duplication_correlation: 0.0,
            delay: 0.0,
            jitter: 0.0,
            delay_jitter_correlation: 0.0,
            reorder_ratio: 0.0,
            reorder_correlation: 0.0,
            reorder_gap: 0,
            distribution: "normal".to_string(),
            limit: 0,
            rate: 0,
            rate_packetoverhead: 0,
            rate_cellsize: 0,
            rate_celloverhead: 0,
            slot_min_delay: 0.0,
            slot_max_delay: 0.0,
            slot_distribution: "normal".to_string(),
            slot_delay: 0.0,
            slot_jitter: 0.0,
            slot_packets: 0,
            slot_bytes: 0,
        }
    }
}

fn pct(ratio: f64) -> i64 {
    (ratio * 1e2) as i64
}

fn ms(seconds: f64) -> i64 {
    (seconds * 1e3) as i64
}

/// Render the netem qdisc command. Keyword order is fixed: limit, loss,
/// duplicate, delay (jitter, correlation, distribution, reorder), rate,
/// slot.
pub fn netem_command(
    interface: &str,
    parent: &str,
    handle: &str,
    operation: &str,
    params: &NetemParams,
) -> String {
    let limit = if params.limit == 0 {
        DEFAULT_LIMIT
    } else {
        params.limit
    };

    let mut cmd = format!(
        "tc qdisc {operation} dev {interface} parent {parent} handle {handle} netem limit {limit}"
    );

    if params.loss_ratio > 0.0 {
        cmd += &format!(" loss random {}%", pct(params.loss_ratio));
        if params.loss_correlation > 0.0 {
            cmd += &format!(" {}%", pct(params.loss_correlation));
        }
    }

    if params.duplication_ratio > 0.0 {
        cmd += &format!(" duplicate {}%", pct(params.duplication_ratio));
        if params.duplication_correlation > 0.0 {
            cmd += &format!(" {}%", pct(params.duplication_correlation));
        }
    }

    if params.delay > 0.0 {
        cmd += &format!(" delay {}ms", ms(params.delay));
        if params.jitter > 0.0 {
            cmd += &format!(" {}ms", ms(params.jitter));
            if params.delay_jitter_correlation > 0.0 {
                cmd += &format!(" {}%", pct(params.delay_jitter_correlation));
            }
        }

        if params.distribution != "normal" {
            cmd += &format!(" distribution {}", params.distribution);
        }

        if params.reorder_ratio > 0.0 {
            cmd += &format!(" reorder {}%", pct(params.reorder_ratio));
            if params.reorder_correlation > 0.0 {
                cmd += &format!(" {}%", pct(params.reorder_correlation));
            }
            if params.reorder_gap > 0 {
                cmd += &format!(" gap {}", params.reorder_gap);
            }
        }
    }

    if params.rate > 0 {
        cmd += &format!(" rate {}kbit", params.rate);
        if params.rate_packetoverhead != 0 {
            cmd += &format!(" {}", params.rate_packetoverhead);
            if params.rate_cellsize > 0 {
                cmd += &format!(" {}", params.rate_cellsize);
                if params.rate_celloverhead > 0 {
                    cmd += &format!(" {}", params.rate_celloverhead);
                }
            }
        }
    }

    if params.slot_min_delay > 0.0 || (params.slot_delay > 0.0 && params.slot_jitter > 0.0) {
        cmd += " slot";
        if params.slot_min_delay > 0.0 {
            cmd += &format!(" {}ms", ms(params.slot_min_delay));
            if params.slot_max_delay > 0.0 {
                cmd += &format!(" {}ms", ms(params.slot_max_delay));
            }
        } else {
            cmd += &format!(
                " distribution {} {}ms {}ms",
                params.slot_distribution,
                ms(params.slot_delay),
                ms(params.slot_jitter)
            );
        }

        if params.slot_packets > 0 {
            cmd += &format!(" packets {}", params.slot_packets);
        }
        if params.slot_bytes > 0 {
            cmd += &format!(" bytes {}", params.slot_bytes);
        }
    }

    cmd
}

#[derive(Clone, Copy, Debug)]
struct Band {
    band: u16,
    /// Whether a netem leaf qdisc was installed under the band.
    leaf: bool,
}

pub struct BuiltinController<E> {
    emitter: Arc<E>,
    interface: String,
    marks: MarkPool,
    registry: ProfileRegistry,
    /// Number of profile bands of the root qdisc (on top of the 3
    /// reserved ones).
    prio_bands: u16,
    bands_avail: BTreeSet<u16>,
    bands: HashMap<String, Band>,
}

impl<E: Emitter> BuiltinController<E> {
    #[tracing::instrument(level = Level::DEBUG, skip(emitter, marks), err)]
    pub async fn init(emitter: Arc<E>, interface: &str, marks: MarkPool) -> AgentResult<Self> {
        let mut ctrl = Self {
            emitter,
            interface: interface.to_string(),
            marks,
            registry: ProfileRegistry::default(),
            prio_bands: 0,
            bands_avail: BTreeSet::new(),
            bands: HashMap::new(),
        };

        ctrl.setup_prio(true, INITIAL_BANDS)
            .await
            .map_err(|error| match error {
                AgentError::Emit(source) => AgentError::Unrecoverable {
                    interface: interface.to_string(),
                    source,
                },
                other => other,
            })?;

        Ok(ctrl)
    }

    /// Create or grow the root prio qdisc.
    ///
    /// Growing uses `change`, which the kernel only accepts for a band
    /// count >= the current one; existing bands keep their numbers.
    async fn setup_prio(&mut self, initial: bool, bands_extra: u16) -> AgentResult<()> {
        let first_new_band = 3 + self.prio_bands;
        self.prio_bands += bands_extra;

        let operation = if initial {
            tracing::info!(
                interface = %self.interface,
                bands = self.prio_bands + 3,
                "Performing initial setup of prio qdisc"
            );

            self.emitter
                .tc_quiet(&format!("tc qdisc delete dev {} root", self.interface))
                .await;

            "add"
        } else {
            tracing::info!(
                interface = %self.interface,
                bands = self.prio_bands + 3,
                "Growing prio qdisc"
            );

            "change"
        };

        self.emitter
            .tc(&format!(
                "tc qdisc {operation} dev {} root handle 1: prio bands {}",
                self.interface,
                self.prio_bands + 3
            ))
            .await?;

        // Only the new bands enter the pool; bands handed out earlier
        // stay with their profiles.
        self.bands_avail.extend(first_new_band..3 + self.prio_bands);

        self.dump_tc().await;

        Ok(())
    }

    async fn dump_tc(&self) {
        self.emitter
            .tc_quiet(&format!("tc qdisc show dev {}", self.interface))
            .await;
        self.emitter
            .tc_quiet(&format!("tc filter show dev {}", self.interface))
            .await;
        self.emitter
            .tc_quiet(&format!("tc -g class show dev {}", self.interface))
            .await;
    }

    fn netem_params(profile: &ProfileHandle) -> AgentResult<Option<NetemParams>> {
        profile
            .parameters
            .get("netem")
            .map(|block| serde_json::from_value(block.clone()).map_err(AgentError::Json))
            .transpose()
    }

    async fn attach(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        if self.bands_avail.is_empty() {
            tracing::info!("No more bands in prio qdisc available, requesting more");
            self.setup_prio(false, EXTRA_BANDS).await?;
        }

        let band = self
            .bands_avail
            .pop_first()
            .expect("band pool was grown before allocation");

        tracing::info!(profile = %profile.name, band, "Assigned prio qdisc band");

        let parent = format!("1:{band}");
        let handle = format!("{}:", 1000 + band);

        self.emitter
            .tc(&format!(
                "tc filter add dev {} prio {band} handle {} fw flowid {parent}",
                self.interface, profile.mark
            ))
            .await?;

        let mut leaf = false;
        if let Some(params) = Self::netem_params(profile)? {
            self.emitter
                .tc(&netem_command(
                    &self.interface,
                    &parent,
                    &handle,
                    "add",
                    &params,
                ))
                .await?;
            leaf = true;
        }

        self.bands.insert(profile.uid.clone(), Band { band, leaf });

        Ok(())
    }

    async fn detach(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        let Some(Band { band, leaf }) = self.bands.remove(&profile.uid) else {
            tracing::warn!(profile = %profile.name, "Profile has no band associated, skipping tc removal");
            return Ok(());
        };

        tracing::info!(profile = %profile.name, band, "Removing tc filter and netem qdisc");

        self.emitter
            .tc(&format!(
                "tc filter delete dev {} parent 1: prio {band} handle {} fw",
                self.interface, profile.mark
            ))
            .await?;

        if leaf {
            self.emitter
                .tc(&format!(
                    "tc qdisc delete dev {} parent 1:{band} handle {}:",
                    self.interface,
                    1000 + band
                ))
                .await?;
        }

        self.dump_tc().await;

        self.bands_avail.insert(band);

        Ok(())
    }

    async fn change(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        let Some(state) = self.bands.get(&profile.uid).copied() else {
            tracing::info!(profile = %profile.name, "Profile was never attached, attaching now");
            return self.attach(profile).await;
        };

        let Some(params) = Self::netem_params(profile)? else {
            return Ok(());
        };

        let parent = format!("1:{}", state.band);
        let handle = format!("{}:", 1000 + state.band);
        let operation = if state.leaf { "change" } else { "add" };

        self.emitter
            .tc(&netem_command(
                &self.interface,
                &parent,
                &handle,
                operation,
                &params,
            ))
            .await?;

        self.bands
            .insert(profile.uid.clone(), Band { leaf: true, ..state });

        Ok(())
    }
}

#[async_trait]
impl<E: Emitter> ImpairmentController for BuiltinController<E> {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Builtin
    }

    fn get_mark(&self) -> u32 {
        self.marks.next()
    }

    fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, profile), fields(profile = %profile.name), err)]
    async fn add_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.insert_new(profile)?;
        self.attach(profile).await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, profile), fields(profile = %profile.name), err)]
    async fn update_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.replace(profile)?;
        self.change(profile).await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, profile), fields(profile = %profile.name), err)]
    async fn remove_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.remove(profile)?;
        self.detach(profile).await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    async fn deinit(&mut self) -> AgentResult<()> {
        self.emitter
            .tc_quiet(&format!("tc qdisc delete dev {} root", self.interface))
            .await;

        self.dump_tc().await;

        Ok(())
    }
}
