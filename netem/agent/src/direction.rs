//! Direction manager.
//!
//! A direction groups the rules of one traffic side under a base chain in
//! the profile's table. Updates are differential: rules whose content
//! survives a MODIFIED event keep their row, their sets and their running
//! peer watchers.

use std::collections::HashMap;

use netem_crd::RuleSpec;
use tracing::Level;

use crate::{
    context::Ctx,
    emitter::Emitter,
    error::AgentResult,
    nft::{Chain, NftCommand, NftObject},
    rule::{content_hash, Rule},
};

pub struct Direction<E> {
    ingress: bool,
    chain: String,
    table: String,
    mark: u32,
    ctx: Ctx<E>,
    rules: Vec<Rule<E>>,
}

impl<E: Emitter> Direction<E> {
    pub fn new(ctx: Ctx<E>, table: impl Into<String>, ingress: bool, mark: u32) -> Self {
        Self {
            ingress,
            chain: if ingress { "ingress" } else { "egress" }.to_string(),
            table: table.into(),
            mark,
            ctx,
            rules: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    #[cfg(test)]
    pub fn rules(&self) -> &[Rule<E>] {
        &self.rules
    }

    fn hook(&self) -> &'static str {
        if self.ingress {
            "input"
        } else {
            "output"
        }
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, specs), fields(chain = %self.chain), err)]
    pub async fn init(&mut self, specs: &[RuleSpec]) -> AgentResult<()> {
        self.ctx
            .emitter
            .nft(vec![NftCommand::Add(NftObject::Chain(Chain::base(
                self.table.clone(),
                self.chain.clone(),
                self.hook(),
            )))])
            .await?;

        for (index, spec) in specs.iter().enumerate() {
            let mut rule = Rule::new(
                self.ctx.clone(),
                self.table.clone(),
                self.chain.clone(),
                self.ingress,
                self.mark,
                index,
                spec.clone(),
            );
            rule.init().await?;
            self.rules.push(rule);
        }

        tracing::info!(chain = %self.chain, rules = self.rules.len(), "Initialized direction");

        Ok(())
    }

    /// Differential update of the rule list.
    ///
    /// Rules are matched by content hash: a spec already present keeps its
    /// existing rule untouched, new specs get fresh rules, and rules whose
    /// spec disappeared are torn down.
    #[tracing::instrument(level = Level::DEBUG, skip(self, specs), fields(chain = %self.chain), err)]
    pub async fn update(&mut self, specs: &[RuleSpec]) -> AgentResult<()> {
        let mut surviving: HashMap<u64, Vec<Rule<E>>> = HashMap::new();
        for rule in self.rules.drain(..) {
            surviving.entry(rule.hash()).or_default().push(rule);
        }

        let mut rules = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let hash = content_hash(spec);

            if let Some(rule) = surviving.get_mut(&hash).and_then(Vec::pop) {
                rules.push(rule);
                continue;
            }

            let mut rule = Rule::new(
                self.ctx.clone(),
                self.table.clone(),
                self.chain.clone(),
                self.ingress,
                self.mark,
                index,
                spec.clone(),
            );
            rule.init().await?;
            rules.push(rule);
        }

        for mut rule in surviving.into_values().flatten() {
            if let Err(error) = rule.deinit().await {
                tracing::warn!(%error, rule = %rule.name(), "Failed to tear down removed rule");
            }
        }

        self.rules = rules;

        Ok(())
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(chain = %self.chain), err)]
    pub async fn deinit(&mut self) -> AgentResult<()> {
        for rule in &mut self.rules {
            rule.deinit().await?;
        }
        self.rules.clear();

        self.ctx
            .emitter
            .nft(vec![NftCommand::Delete(NftObject::Chain(Chain::named(
                self.table.clone(),
                self.chain.clone(),
            )))])
            .await?;

        tracing::info!(chain = %self.chain, "Deinitialized direction");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use super::*;
    use crate::{emitter::MockEmitter, sets::SetStore};

    fn rule_spec(json: serde_json::Value) -> RuleSpec {
        serde_json::from_value(json).unwrap()
    }

    fn relaxed_ctx() -> Ctx<MockEmitter> {
        let mut mock = MockEmitter::new();
        mock.expect_nft()
            .returning(|cmds| match cmds.first() {
                Some(NftCommand::List(_)) => Ok(serde_json::json!({ "nftables": [] })),
                _ => Ok(Value::Null),
            });

        let emitter = Arc::new(mock);
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());

        Ctx {
            sets: Arc::new(SetStore::new(emitter.clone())),
            emitter,
            client: kube::Client::try_from(config).unwrap(),
        }
    }

    #[tokio::test]
    async fn surviving_rules_keep_their_name() {
        let first = rule_spec(serde_json::json!({
            "to": [{"ipBlock": {"cidr": "10.0.0.0/8"}}],
            "ports": [{"port": 80}]
        }));
        let second = rule_spec(serde_json::json!({
            "to": [{"ipBlock": {"cidr": "192.168.0.0/16"}}]
        }));

        let mut direction = Direction::new(relaxed_ctx(), "t", false, 1000);
        direction.init(std::slice::from_ref(&first)).await.unwrap();

        let original = direction.rules()[0].name().to_string();

        direction
            .update(&[first.clone(), second.clone()])
            .await
            .unwrap();

        assert_eq!(direction.rules().len(), 2);
        assert_eq!(direction.rules()[0].name(), original);
        assert_ne!(direction.rules()[1].name(), original);
    }

    #[tokio::test]
    async fn removed_rules_are_torn_down() {
        let first = rule_spec(serde_json::json!({
            "ports": [{"port": 80}]
        }));

        let mut direction = Direction::new(relaxed_ctx(), "t", false, 1000);
        direction.init(std::slice::from_ref(&first)).await.unwrap();
        assert_eq!(direction.rules().len(), 1);

        direction.update(&[]).await.unwrap();
        assert!(direction.rules().is_empty());
    }

    #[tokio::test]
    async fn chain_names_follow_the_direction() {
        let ingress = Direction::new(relaxed_ctx(), "t", true, 1000);
        let egress = Direction::new(relaxed_ctx(), "t", false, 1000);

        assert_eq!(ingress.chain(), "ingress");
        assert_eq!(ingress.hook(), "input");
        assert_eq!(egress.chain(), "egress");
        assert_eq!(egress.hook(), "output");
    }
}
