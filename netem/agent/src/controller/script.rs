//! Script controller: delegates impairment to an external `tc-script`
//! process fed through a JSON config file that is rewritten on every
//! profile change.

use async_trait::async_trait;
use netem_crd::ControllerKind;
use serde_json::json;
use tracing::Level;

use crate::{
    error::AgentResult,
    profile::ProfileHandle,
};

use super::{ImpairmentController, MarkPool, ProfileRegistry};

const EXECUTABLE: &str = "tc-script";

pub struct ScriptController {
    interface: String,
    marks: MarkPool,
    registry: ProfileRegistry,
    config_file: tempfile::NamedTempFile,
    child: Option<tokio::process::Child>,
}

/// The config document handed to the script: one flow per profile, keyed
/// by its fwmark.
fn render_config(interface: &str, registry: &ProfileRegistry) -> serde_json::Value {
    let flows: Vec<serde_json::Value> = registry
        .iter()
        .map(|profile| {
            json!({
                "metadata": { "name": profile.name, "uid": profile.uid },
                "filter": { "fwmark": profile.mark },
                "parameters": profile.parameters,
            })
        })
        .collect();

    json!({
        "interface": interface,
        "flows": flows,
    })
}

impl ScriptController {
    #[tracing::instrument(level = Level::DEBUG, skip(marks), err)]
    pub async fn init(interface: &str, marks: MarkPool) -> AgentResult<Self> {
        let mut ctrl = Self {
            interface: interface.to_string(),
            marks,
            registry: ProfileRegistry::default(),
            config_file: tempfile::NamedTempFile::new()?,
            child: None,
        };

        ctrl.write_config().await?;

        let child = tokio::process::Command::new(EXECUTABLE)
            .arg(ctrl.config_file.path())
            .spawn()?;
        ctrl.child = Some(child);

        tracing::info!(interface, "Started {EXECUTABLE}");

        Ok(ctrl)
    }

    async fn write_config(&self) -> AgentResult<()> {
        let config = render_config(&self.interface, &self.registry);

        tokio::fs::write(self.config_file.path(), serde_json::to_vec_pretty(&config)?).await?;

        Ok(())
    }
}

#[async_trait]
impl ImpairmentController for ScriptController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Script
    }

    fn get_mark(&self) -> u32 {
        self.marks.next()
    }

    fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    async fn add_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.insert_new(profile)?;
        self.write_config().await
    }

    async fn update_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.replace(profile)?;
        self.write_config().await
    }

    async fn remove_profile(&mut self, profile: &ProfileHandle) -> AgentResult<()> {
        self.registry.remove(profile)?;
        self.write_config().await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    async fn deinit(&mut self) -> AgentResult<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
            child.wait().await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_lists_one_flow_per_profile() {
        let mut registry = ProfileRegistry::default();
        registry
            .insert_new(&ProfileHandle {
                uid: "u1".into(),
                name: "p1".into(),
                mark: 1000,
                parameters: json!({"netem": {"delay": 0.1}}),
            })
            .unwrap();

        let config = render_config("eth0", &registry);

        assert_eq!(config["interface"], "eth0");
        assert_eq!(config["flows"].as_array().unwrap().len(), 1);
        assert_eq!(config["flows"][0]["filter"]["fwmark"], 1000);
        assert_eq!(config["flows"][0]["metadata"]["name"], "p1");
        assert_eq!(config["flows"][0]["parameters"]["netem"]["delay"], 0.1);
    }

    #[test]
    fn config_is_empty_without_profiles() {
        let config = render_config("eth0", &ProfileRegistry::default());

        assert!(config["flows"].as_array().unwrap().is_empty());
    }
}
