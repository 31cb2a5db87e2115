//! Profile reconciler.
//!
//! One loop consumes the TrafficProfile watch stream and keeps the
//! packet-classification tree (profile tables) and the queueing side
//! (controllers) in step. Controllers are shared per interface; two
//! profiles on one interface must agree on the controller type.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, ResourceExt,
};
use netem_crd::TrafficProfile;
use tokio_util::sync::CancellationToken;

use crate::{
    context::Ctx,
    controller::{Controller, ImpairmentController, MarkPool},
    emitter::Emitter,
    error::{AgentError, AgentResult},
    profile::{profile_matches, profile_uid, ProfileState},
};

struct ActiveProfile<E> {
    state: ProfileState<E>,
    interface: String,
}

pub struct Reconciler<E> {
    ctx: Ctx<E>,
    self_pod: Pod,
    default_interface: String,
    marks: MarkPool,
    profiles: HashMap<String, ActiveProfile<E>>,
    controllers: HashMap<String, Controller<E>>,
}

impl<E: Emitter> Reconciler<E> {
    pub fn new(ctx: Ctx<E>, self_pod: Pod, default_interface: impl Into<String>) -> Self {
        Self {
            ctx,
            self_pod,
            default_interface: default_interface.into(),
            marks: MarkPool::new(),
            profiles: HashMap::new(),
            controllers: HashMap::new(),
        }
    }

    /// Consume the profile watch stream until cancelled, then tear
    /// everything down.
    pub async fn run(&mut self, cancel: CancellationToken) -> AgentResult<()> {
        let api: Api<TrafficProfile> = Api::all(self.ctx.client.clone());
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);

        // UIDs seen during a re-list, to garbage-collect profiles deleted
        // while the stream was down
        let mut relist: Option<HashSet<String>> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };

            match event {
                None => {
                    self.shutdown().await;
                    return Err(AgentError::StreamClosed);
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "Profile watch error, backing off");
                }
                Some(Ok(watcher::Event::Init)) => {
                    relist = Some(HashSet::new());
                }
                Some(Ok(watcher::Event::InitApply(profile))) => {
                    if let Some(seen) = relist.as_mut() {
                        seen.insert(profile_uid(&profile));
                    }
                    self.apply(profile).await;
                }
                Some(Ok(watcher::Event::InitDone)) => {
                    if let Some(seen) = relist.take() {
                        self.collect_stale(seen).await;
                    }
                }
                Some(Ok(watcher::Event::Apply(profile))) => {
                    self.apply(profile).await;
                }
                Some(Ok(watcher::Event::Delete(profile))) => {
                    self.delete(profile).await;
                }
            }
        }

        self.shutdown().await;

        Ok(())
    }

    /// Handle an added or modified profile. A failure affects this event
    /// only; the loop keeps running.
    pub async fn apply(&mut self, profile: TrafficProfile) {
        let name = profile.name_any();

        if let Err(error) = self.try_apply(profile).await {
            tracing::error!(%error, profile = %name, "Failed to apply profile");
        }
    }

    pub async fn delete(&mut self, profile: TrafficProfile) {
        let name = profile.name_any();

        if let Err(error) = self.remove_by_uid(&profile_uid(&profile)).await {
            tracing::error!(%error, profile = %name, "Failed to remove profile");
        }
    }

    async fn try_apply(&mut self, profile: TrafficProfile) -> AgentResult<()> {
        let uid = profile_uid(&profile);

        if self.profiles.contains_key(&uid) {
            self.modify(&uid, profile).await
        } else {
            self.add(profile).await
        }
    }

    async fn add(&mut self, profile: TrafficProfile) -> AgentResult<()> {
        if !profile_matches(&profile, &self.self_pod) {
            tracing::debug!(profile = %profile.name_any(), "Profile does not select this pod");
            return Ok(());
        }

        let uid = profile_uid(&profile);
        let name = profile.name_any();
        let kind = profile.spec.controller;
        let interface = profile
            .spec
            .interface
            .clone()
            .unwrap_or_else(|| self.default_interface.clone());

        if let Some(existing) = self.controllers.get(&interface) {
            if existing.kind() != kind {
                return Err(AgentError::ControllerConflict {
                    interface,
                    existing: existing.kind(),
                    requested: kind,
                    profile: name,
                });
            }
        } else {
            let ctrl = Controller::create(
                kind,
                &interface,
                self.ctx.emitter.clone(),
                self.marks.clone(),
            )
            .await?;
            self.controllers.insert(interface.clone(), ctrl);
        }

        let ctrl = self
            .controllers
            .get_mut(&interface)
            .expect("controller was just ensured");

        let mark = ctrl.get_mark();

        let mut state = ProfileState::new(self.ctx.clone(), profile);
        if let Err(error) = state.init(mark).await {
            // Roll back whatever made it into the kernel so a retry via a
            // later MODIFIED event starts clean.
            if let Err(error) = state.deinit().await {
                tracing::warn!(%error, profile = %name, "Rollback of failed profile init incomplete");
            }
            return Err(error);
        }

        ctrl.add_profile(&state.handle()).await?;

        tracing::info!(profile = %name, mark, interface, "Profile is now active");

        self.profiles.insert(uid, ActiveProfile { state, interface });

        Ok(())
    }

    async fn modify(&mut self, uid: &str, profile: TrafficProfile) -> AgentResult<()> {
        let entry = self
            .profiles
            .get_mut(uid)
            .expect("modify is only called for active profiles");

        let params_changed = entry.state.update(profile).await?;

        if params_changed {
            if let Some(ctrl) = self.controllers.get_mut(&entry.interface) {
                ctrl.update_profile(&entry.state.handle()).await?;
            }
        }

        Ok(())
    }

    async fn remove_by_uid(&mut self, uid: &str) -> AgentResult<()> {
        let Some(mut entry) = self.profiles.remove(uid) else {
            return Ok(());
        };

        let name = entry.state.name().to_string();

        if let Err(error) = entry.state.deinit().await {
            tracing::warn!(%error, profile = %name, "Failed to tear down profile rules");
        }

        if let Some(ctrl) = self.controllers.get_mut(&entry.interface) {
            ctrl.remove_profile(&entry.state.handle()).await?;

            if ctrl.is_empty() {
                tracing::info!(interface = %entry.interface, "Last profile gone, releasing controller");

                let mut ctrl = self
                    .controllers
                    .remove(&entry.interface)
                    .expect("controller is present");
                ctrl.deinit().await?;
            }
        }

        Ok(())
    }

    /// Drop every profile that disappeared while the stream was down.
    async fn collect_stale(&mut self, seen: HashSet<String>) {
        let stale: Vec<String> = self
            .profiles
            .keys()
            .filter(|uid| !seen.contains(*uid))
            .cloned()
            .collect();

        for uid in stale {
            tracing::info!(uid = %uid, "Profile vanished during stream gap, removing");

            if let Err(error) = self.remove_by_uid(&uid).await {
                tracing::error!(%error, uid = %uid, "Failed to remove stale profile");
            }
        }
    }

    /// Orderly teardown of every profile and controller.
    async fn shutdown(&mut self) {
        tracing::info!("Shutting down, removing all impairments");

        let uids: Vec<String> = self.profiles.keys().cloned().collect();
        for uid in uids {
            if let Err(error) = self.remove_by_uid(&uid).await {
                tracing::warn!(%error, uid = %uid, "Teardown incomplete");
            }
        }

        for (interface, mut ctrl) in self.controllers.drain() {
            if let Err(error) = ctrl.deinit().await {
                tracing::warn!(%error, interface = %interface, "Controller teardown incomplete");
            }
        }
    }

    #[cfg(test)]
    fn active_profiles(&self) -> usize {
        self.profiles.len()
    }

    #[cfg(test)]
    fn active_controllers(&self) -> usize {
        self.controllers.len()
    }

    #[cfg(test)]
    fn mark_of(&self, uid: &str) -> Option<u32> {
        self.profiles.get(uid).map(|entry| entry.state.mark())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kube::api::ObjectMeta;
    use netem_crd::TrafficProfileSpec;

    use super::*;
    use crate::{emitter::MockEmitter, nft::NftCommand, sets::SetStore};

    fn relaxed_ctx() -> Ctx<MockEmitter> {
        let mut mock = MockEmitter::new();
        mock.expect_nft().returning(|cmds| match cmds.first() {
            Some(NftCommand::List(_)) => Ok(serde_json::json!({ "nftables": [] })),
            _ => Ok(serde_json::Value::Null),
        });
        mock.expect_tc().returning(|_| Ok(()));
        mock.expect_tc_quiet().returning(|_| ());

        let emitter = Arc::new(mock);
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());

        Ctx {
            sets: Arc::new(SetStore::new(emitter.clone())),
            emitter,
            client: kube::Client::try_from(config).unwrap(),
        }
    }

    fn self_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("self".into()),
                labels: Some([("app".to_string(), "dut".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn profile(name: &str, spec: serde_json::Value) -> TrafficProfile {
        let spec: TrafficProfileSpec = serde_json::from_value(spec).unwrap();
        let mut profile = TrafficProfile::new(name, spec);
        profile.metadata.uid = Some(format!("uid-{name}"));
        profile
    }

    fn matching_profile(name: &str) -> TrafficProfile {
        profile(
            name,
            serde_json::json!({
                "podSelector": {"matchLabels": {"app": "dut"}},
                "egress": [{"ports": [{"port": 80}]}],
                "parameters": {"netem": {"delay": 0.1}}
            }),
        )
    }

    fn reconciler() -> Reconciler<MockEmitter> {
        Reconciler::new(relaxed_ctx(), self_pod(), "eth0")
    }

    #[tokio::test]
    async fn matching_profile_becomes_active() {
        let mut r = reconciler();

        r.apply(matching_profile("p1")).await;

        assert_eq!(r.active_profiles(), 1);
        assert_eq!(r.active_controllers(), 1);
        assert_eq!(r.mark_of("uid-p1"), Some(1000));
    }

    #[tokio::test]
    async fn non_matching_profile_is_ignored() {
        let mut r = reconciler();

        r.apply(profile(
            "other",
            serde_json::json!({
                "podSelector": {"matchLabels": {"app": "elsewhere"}}
            }),
        ))
        .await;

        assert_eq!(r.active_profiles(), 0);
        assert_eq!(r.active_controllers(), 0);
    }

    #[tokio::test]
    async fn marks_are_pairwise_distinct() {
        let mut r = reconciler();

        r.apply(matching_profile("p1")).await;
        r.apply(matching_profile("p2")).await;
        r.apply(matching_profile("p3")).await;

        let marks: HashSet<_> = ["uid-p1", "uid-p2", "uid-p3"]
            .iter()
            .map(|uid| r.mark_of(uid).unwrap())
            .collect();
        assert_eq!(marks.len(), 3);
    }

    #[tokio::test]
    async fn modified_keeps_mark_and_controller() {
        let mut r = reconciler();

        r.apply(matching_profile("p1")).await;
        let mark = r.mark_of("uid-p1").unwrap();

        let mut changed = matching_profile("p1");
        changed.spec.parameters = serde_json::json!({"netem": {"delay": 0.2}});
        r.apply(changed).await;

        assert_eq!(r.active_profiles(), 1);
        assert_eq!(r.mark_of("uid-p1"), Some(mark));
    }

    #[tokio::test]
    async fn conflicting_controller_type_is_rejected() {
        let mut r = reconciler();

        r.apply(matching_profile("p1")).await;

        let mut flexe = matching_profile("p2");
        flexe.spec.controller = netem_crd::ControllerKind::Flexe;
        let result = r.try_apply(flexe).await;

        assert!(matches!(result, Err(AgentError::ControllerConflict { .. })));
        // the existing profile is untouched
        assert_eq!(r.active_profiles(), 1);
        assert_eq!(r.active_controllers(), 1);
    }

    #[tokio::test]
    async fn last_profile_releases_the_controller() {
        let mut r = reconciler();

        r.apply(matching_profile("p1")).await;
        r.apply(matching_profile("p2")).await;

        r.delete(matching_profile("p1")).await;
        assert_eq!(r.active_controllers(), 1);

        r.delete(matching_profile("p2")).await;
        assert_eq!(r.active_profiles(), 0);
        assert_eq!(r.active_controllers(), 0);
    }

    #[tokio::test]
    async fn stale_profiles_are_collected_after_a_relist() {
        let mut r = reconciler();

        r.apply(matching_profile("p1")).await;
        r.apply(matching_profile("p2")).await;

        let seen: HashSet<String> = [String::from("uid-p2")].into();
        r.collect_stale(seen).await;

        assert_eq!(r.active_profiles(), 1);
        assert!(r.mark_of("uid-p2").is_some());
        assert!(r.mark_of("uid-p1").is_none());
    }

    #[tokio::test]
    async fn delete_of_unknown_profile_is_a_no_op() {
        let mut r = reconciler();

        r.delete(matching_profile("ghost")).await;

        assert_eq!(r.active_profiles(), 0);
    }
}
