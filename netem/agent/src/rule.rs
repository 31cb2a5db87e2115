//! Rule compiler.
//!
//! One declarative rule becomes four named sets plus a single marking
//! rule row in the direction's chain. The row is only announced after the
//! sets hold all static elements, so a packet can never match a subset
//! whose peers are still missing. The row is addressed for update and
//! delete through its comment, which carries the rule's generated name.

use std::hash::{Hash, Hasher};

use ipnet::Ipv4Net;
use netem_crd::RuleSpec;
use rand::distr::{Alphanumeric, SampleString};
use serde_json::json;
use tracing::Level;

use crate::{
    context::Ctx,
    emitter::Emitter,
    error::{AgentError, AgentResult},
    nft::{
        self, find_rule_handle, Chain, Expression, NftCommand, NftObject, Rule as NftRule, SetKind,
    },
    peer::{NetsHandle, Peer},
    sets::SetElement,
};

/// Stable content hash of a rule spec, used by the direction diff.
///
/// serde_json maps are ordered, so the serialised form is canonical.
pub fn content_hash(spec: &RuleSpec) -> u64 {
    let canonical = serde_json::to_value(spec)
        .expect("rule specs always serialise")
        .to_string();

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

pub struct Rule<E> {
    name: String,
    ingress: bool,
    table: String,
    chain: String,
    mark: u32,
    spec: RuleSpec,
    hash: u64,
    ctx: Ctx<E>,
    peers: Vec<Peer<E>>,
}

impl<E: Emitter> Rule<E> {
    pub fn new(
        ctx: Ctx<E>,
        table: impl Into<String>,
        chain: impl Into<String>,
        ingress: bool,
        mark: u32,
        index: usize,
        spec: RuleSpec,
    ) -> Self {
        let chain = chain.into();
        // The generation suffix makes names collision-free across rule
        // recreations within the same direction.
        let generation = Alphanumeric
            .sample_string(&mut rand::rng(), 6)
            .to_lowercase();
        let name = format!("{chain}-{index}-{generation}");
        let hash = content_hash(&spec);

        Self {
            name,
            ingress,
            table: table.into(),
            chain,
            mark,
            spec,
            hash,
            ctx,
            peers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn set_nets(&self) -> String {
        format!("{}-nets", self.name)
    }

    pub fn set_ports(&self) -> String {
        format!("{}-ports", self.name)
    }

    pub fn set_ether_types(&self) -> String {
        format!("{}-ether-types", self.name)
    }

    pub fn set_inet_protos(&self) -> String {
        format!("{}-inet-protos", self.name)
    }

    /// Handle with which the peer watchers edit the nets set.
    pub fn nets_handle(&self) -> NetsHandle<E> {
        NetsHandle::new(self.ctx.sets.clone(), self.table.clone(), self.set_nets())
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(rule = %self.name), err)]
    pub async fn init(&mut self) -> AgentResult<()> {
        self.init_sets().await?;
        self.add_row().await?;
        self.start_peers();

        tracing::info!(rule = %self.name, "Initialized rule");

        Ok(())
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(rule = %self.name), err)]
    pub async fn deinit(&mut self) -> AgentResult<()> {
        self.stop_peers();
        self.delete_row().await?;
        self.deinit_sets().await?;

        tracing::info!(rule = %self.name, "Deinitialized rule");

        Ok(())
    }

    /// Replace this rule's spec in place, keeping its name and therefore
    /// its position in the chain addressable. The row is always rebuilt;
    /// the sets only when their membership changed.
    pub async fn update(&mut self, spec: RuleSpec) -> AgentResult<()> {
        let membership_changed = self.spec != spec;

        self.delete_row().await?;

        if membership_changed {
            self.stop_peers();
            self.deinit_sets().await?;

            self.spec = spec;
            self.hash = content_hash(&self.spec);

            self.init_sets().await?;
        }

        self.add_row().await?;

        if membership_changed {
            self.start_peers();
        }

        Ok(())
    }

    async fn init_sets(&self) -> AgentResult<()> {
        let sets = &self.ctx.sets;

        sets.create_set(&self.table, &self.set_nets(), SetKind::Ipv4Interval)
            .await?;
        sets.create_set(&self.table, &self.set_ports(), SetKind::ProtoPort)
            .await?;
        sets.create_set(&self.table, &self.set_ether_types(), SetKind::EtherType)
            .await?;
        sets.create_set(&self.table, &self.set_inet_protos(), SetKind::InetProto)
            .await?;

        for ether_type in &self.spec.ether_types {
            sets.add_element(
                &self.table,
                &self.set_ether_types(),
                SetElement::Proto(ether_type.clone()),
                None,
            )
            .await?;
        }

        for proto in &self.spec.inet_protos {
            sets.add_element(
                &self.table,
                &self.set_inet_protos(),
                SetElement::Proto(proto.clone()),
                None,
            )
            .await?;
        }

        for peer in self.spec.peers(self.ingress) {
            if let Some(block) = &peer.ip_block {
                let net: Ipv4Net = block.cidr.parse().map_err(AgentError::Cidr)?;

                sets.add_element(&self.table, &self.set_nets(), SetElement::Net(net), None)
                    .await?;
            }
        }

        for port in &self.spec.ports {
            sets.add_element(
                &self.table,
                &self.set_ports(),
                SetElement::ProtoPort(port.protocol(), port.port),
                None,
            )
            .await?;
        }

        Ok(())
    }

    async fn deinit_sets(&self) -> AgentResult<()> {
        let sets = &self.ctx.sets;

        sets.delete_set(&self.table, &self.set_nets()).await?;
        sets.delete_set(&self.table, &self.set_ports()).await?;
        sets.delete_set(&self.table, &self.set_ether_types()).await?;
        sets.delete_set(&self.table, &self.set_inet_protos()).await?;

        Ok(())
    }

    /// Predicate of the rule row: the conjunction of every non-empty
    /// subset, followed by the mark mangle.
    fn expressions(&self) -> Vec<Expression> {
        let mut expr = Vec::new();

        if !self.spec.ether_types.is_empty() {
            expr.push(nft::match_set(
                nft::meta("protocol"),
                &self.set_ether_types(),
            ));
        }

        if !self.spec.inet_protos.is_empty() {
            expr.push(nft::match_set(
                nft::meta("l4proto"),
                &self.set_inet_protos(),
            ));
        }

        if !self.spec.peers(self.ingress).is_empty() {
            // Ingress classifies on who sent the packet, egress on where
            // it is headed.
            let field = if self.ingress { "saddr" } else { "daddr" };

            expr.push(nft::match_set(nft::payload("ip", field), &self.set_nets()));
        }

        if !self.spec.ports.is_empty() {
            expr.push(nft::match_set(
                json!({ "concat": [nft::meta("l4proto"), nft::payload("th", "dport")] }),
                &self.set_ports(),
            ));
        }

        expr.push(nft::mangle_mark(self.mark));

        expr
    }

    async fn add_row(&self) -> AgentResult<()> {
        self.ctx
            .emitter
            .nft(vec![NftCommand::Add(NftObject::Rule(NftRule::new(
                self.table.clone(),
                self.chain.clone(),
                self.expressions(),
                self.name.clone(),
            )))])
            .await?;

        Ok(())
    }

    async fn delete_row(&self) -> AgentResult<()> {
        let Some(handle) = self.find_handle().await? else {
            tracing::warn!(rule = %self.name, "Rule row not found, nothing to delete");
            return Ok(());
        };

        self.ctx
            .emitter
            .nft(vec![NftCommand::Delete(NftObject::Rule(
                NftRule::by_handle(self.table.clone(), self.chain.clone(), handle),
            ))])
            .await?;

        Ok(())
    }

    /// Locate the rule row in its chain by comment.
    async fn find_handle(&self) -> AgentResult<Option<u64>> {
        let output = self
            .ctx
            .emitter
            .nft(vec![NftCommand::List(NftObject::Chain(Chain::named(
                self.table.clone(),
                self.chain.clone(),
            )))])
            .await?;

        Ok(find_rule_handle(&output, &self.name))
    }

    fn start_peers(&mut self) {
        let peers = self.spec.peers(self.ingress).to_vec();

        for (index, spec) in peers.into_iter().enumerate() {
            if !spec.is_dynamic() {
                continue;
            }

            let peer = Peer::new(self.ctx.client.clone(), self.nets_handle(), index, spec);
            peer.init();
            self.peers.push(peer);
        }
    }

    fn stop_peers(&mut self) {
        for peer in &self.peers {
            peer.deinit();
        }

        self.peers.clear();
    }
}
