//! Runtime state of one active traffic profile.
//!
//! A profile owns one nftables table named after it, holding up to two
//! direction chains. Its identity is the resource UID; the impairment
//! parameters are opaque here and only compared for change detection.

use std::hash::{Hash, Hasher};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use netem_crd::{selector::LabelSelectorExt, TrafficProfile};
use serde_json::Value;
use tracing::Level;

use crate::{
    context::Ctx,
    direction::Direction,
    emitter::Emitter,
    error::AgentResult,
    nft::{NftCommand, NftObject, Table, TABLE_PREFIX},
};

/// UID of a profile resource, falling back to its name for objects that
/// never hit the API server (tests, files).
pub fn profile_uid(profile: &TrafficProfile) -> String {
    profile
        .metadata
        .uid
        .clone()
        .unwrap_or_else(|| profile.name_any())
}

/// Whether the profile's pod selector matches the given pod.
pub fn profile_matches(profile: &TrafficProfile, pod: &Pod) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();

    profile.spec.pod_selector.matches(&labels)
}

/// Canonical hash of an opaque parameter block. serde_json maps iterate
/// in key order, so equal documents hash equally regardless of input
/// formatting.
pub fn params_hash(parameters: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    parameters.to_string().hash(&mut hasher);
    hasher.finish()
}

/// The slice of profile state a controller needs to drive its queueing
/// side: identity, mark and the opaque parameters.
#[derive(Clone, Debug)]
pub struct ProfileHandle {
    pub uid: String,
    pub name: String,
    pub mark: u32,
    pub parameters: Value,
}

pub struct ProfileState<E> {
    resource: TrafficProfile,
    uid: String,
    name: String,
    table: String,
    mark: u32,
    params_hash: u64,
    ingress: Option<Direction<E>>,
    egress: Option<Direction<E>>,
    ctx: Ctx<E>,
}

impl<E: Emitter> ProfileState<E> {
    pub fn new(ctx: Ctx<E>, resource: TrafficProfile) -> Self {
        let uid = profile_uid(&resource);
        let name = resource.name_any();
        let table = format!("{TABLE_PREFIX}-{name}");
        let params_hash = params_hash(&resource.spec.parameters);

        Self {
            resource,
            uid,
            name,
            table,
            mark: 0,
            params_hash,
            ingress: None,
            egress: None,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    #[cfg(test)]
    pub fn mark(&self) -> u32 {
        self.mark
    }

    #[cfg(test)]
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn handle(&self) -> ProfileHandle {
        ProfileHandle {
            uid: self.uid.clone(),
            name: self.name.clone(),
            mark: self.mark,
            parameters: self.resource.spec.parameters.clone(),
        }
    }

    /// Install the packet classification side of the profile: the table,
    /// one chain per present direction and their rules.
    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(profile = %self.name, mark), err)]
    pub async fn init(&mut self, mark: u32) -> AgentResult<()> {
        self.mark = mark;

        self.ctx
            .emitter
            .nft(vec![NftCommand::Add(NftObject::Table(Table::new(
                self.table.clone(),
            )))])
            .await?;

        if let Some(specs) = self.resource.spec.ingress.clone() {
            let mut direction = Direction::new(self.ctx.clone(), self.table.clone(), true, mark);
            direction.init(&specs).await?;
            self.ingress = Some(direction);
        }

        if let Some(specs) = self.resource.spec.egress.clone() {
            let mut direction = Direction::new(self.ctx.clone(), self.table.clone(), false, mark);
            direction.init(&specs).await?;
            self.egress = Some(direction);
        }

        tracing::info!(profile = %self.name, mark, "Initialized profile");

        Ok(())
    }

    /// Apply a MODIFIED resource. Directions are rewired differentially;
    /// the return value reports whether the impairment parameters changed
    /// and the controller therefore needs to act too.
    pub async fn update(&mut self, new: TrafficProfile) -> AgentResult<bool> {
        let ingress = new.spec.ingress.clone();
        let egress = new.spec.egress.clone();

        self.ingress = Self::update_direction(
            &self.ctx,
            &self.table,
            true,
            self.mark,
            self.ingress.take(),
            ingress,
        )
        .await?;
        self.egress = Self::update_direction(
            &self.ctx,
            &self.table,
            false,
            self.mark,
            self.egress.take(),
            egress,
        )
        .await?;

        let new_hash = params_hash(&new.spec.parameters);
        let params_changed = new_hash != self.params_hash;

        self.params_hash = new_hash;
        self.resource = new;

        Ok(params_changed)
    }

    async fn update_direction(
        ctx: &Ctx<E>,
        table: &str,
        ingress: bool,
        mark: u32,
        current: Option<Direction<E>>,
        specs: Option<Vec<netem_crd::RuleSpec>>,
    ) -> AgentResult<Option<Direction<E>>> {
        match (current, specs) {
            (Some(mut direction), Some(specs)) => {
                direction.update(&specs).await?;
                Ok(Some(direction))
            }
            (Some(mut direction), None) => {
                direction.deinit().await?;
                Ok(None)
            }
            (None, Some(specs)) => {
                let mut direction = Direction::new(ctx.clone(), table.to_string(), ingress, mark);
                direction.init(&specs).await?;
                Ok(Some(direction))
            }
            (None, None) => Ok(None),
        }
    }

    /// Tear down both directions and the table.
    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(profile = %self.name), err)]
    pub async fn deinit(&mut self) -> AgentResult<()> {
        if let Some(mut direction) = self.ingress.take() {
            direction.deinit().await?;
        }

        if let Some(mut direction) = self.egress.take() {
            direction.deinit().await?;
        }

        self.ctx
            .emitter
            .nft(vec![NftCommand::Delete(NftObject::Table(Table::new(
                self.table.clone(),
            )))])
            .await?;

        tracing::info!(profile = %self.name, "Deinitialized profile");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kube::api::ObjectMeta;
    use netem_crd::TrafficProfileSpec;

    use super::*;
    use crate::{emitter::MockEmitter, sets::SetStore};

    fn profile(name: &str, spec: serde_json::Value) -> TrafficProfile {
        let spec: TrafficProfileSpec = serde_json::from_value(spec).unwrap();
        let mut profile = TrafficProfile::new(name, spec);
        profile.metadata.uid = Some(format!("uid-{name}"));
        profile
    }

    fn relaxed_ctx() -> Ctx<MockEmitter> {
        let mut mock = MockEmitter::new();
        mock.expect_nft().returning(|cmds| match cmds.first() {
            Some(NftCommand::List(_)) => Ok(serde_json::json!({ "nftables": [] })),
            _ => Ok(serde_json::Value::Null),
        });

        let emitter = Arc::new(mock);
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());

        Ctx {
            sets: Arc::new(SetStore::new(emitter.clone())),
            emitter,
            client: kube::Client::try_from(config).unwrap(),
        }
    }

    fn pod_with_labels(pairs: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("self".into()),
                labels: Some(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn matching_against_the_own_pod() {
        let profile = profile(
            "p1",
            serde_json::json!({
                "podSelector": {"matchLabels": {"app": "dut"}}
            }),
        );

        assert!(profile_matches(&profile, &pod_with_labels(&[("app", "dut")])));
        assert!(!profile_matches(&profile, &pod_with_labels(&[("app", "other")])));
        assert!(!profile_matches(&profile, &pod_with_labels(&[])));
    }

    #[test]
    fn empty_selector_matches_any_pod() {
        let profile = profile("p1", serde_json::json!({ "podSelector": {} }));

        assert!(profile_matches(&profile, &pod_with_labels(&[])));
    }

    #[tokio::test]
    async fn update_reports_parameter_changes_only() {
        let mut state = ProfileState::new(
            relaxed_ctx(),
            profile(
                "p1",
                serde_json::json!({
                    "podSelector": {},
                    "egress": [{"ports": [{"port": 80}]}],
                    "parameters": {"netem": {"delay": 0.1}}
                }),
            ),
        );
        state.init(1000).await.unwrap();

        // rule-level edit, same parameters: no controller action needed
        let changed = state
            .update(profile(
                "p1",
                serde_json::json!({
                    "podSelector": {},
                    "egress": [{"ports": [{"port": 80}]}, {"ports": [{"port": 443}]}],
                    "parameters": {"netem": {"delay": 0.1}}
                }),
            ))
            .await
            .unwrap();
        assert!(!changed);

        // parameter edit
        let changed = state
            .update(profile(
                "p1",
                serde_json::json!({
                    "podSelector": {},
                    "egress": [{"ports": [{"port": 80}]}, {"ports": [{"port": 443}]}],
                    "parameters": {"netem": {"delay": 0.2}}
                }),
            ))
            .await
            .unwrap();
        assert!(changed);
    }

    #[tokio::test]
    async fn directions_come_and_go_across_updates() {
        let mut state = ProfileState::new(
            relaxed_ctx(),
            profile(
                "p1",
                serde_json::json!({
                    "podSelector": {},
                    "egress": [{"ports": [{"port": 80}]}]
                }),
            ),
        );
        state.init(1000).await.unwrap();
        assert!(state.egress.is_some());
        assert!(state.ingress.is_none());

        state
            .update(profile(
                "p1",
                serde_json::json!({
                    "podSelector": {},
                    "ingress": [{"ports": [{"port": 22}]}]
                }),
            ))
            .await
            .unwrap();
        assert!(state.egress.is_none());
        assert!(state.ingress.is_some());
    }

    #[tokio::test]
    async fn table_name_carries_the_prefix() {
        let state = ProfileState::new(relaxed_ctx(), profile("p1", serde_json::json!({
            "podSelector": {}
        })));

        assert_eq!(state.table(), "k8s-netem-p1");
        assert_eq!(state.uid(), "uid-p1");
    }
}
