//! Peer resolver.
//!
//! A dynamic peer (one with selectors) is backed by a small tree of watch
//! tasks: a namespace-level watcher spawning one pod-level watcher per
//! matching namespace, or a single cluster-wide pod watcher when only a
//! pod selector is given. Pod watchers edit the owning rule's nets set
//! through a [`NetsHandle`]; all edits are idempotent, so ordering across
//! watchers does not matter.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Client, ResourceExt,
};
use netem_crd::{selector::LabelSelectorExt, PeerSpec};
use tokio_util::sync::CancellationToken;

use crate::{
    emitter::Emitter,
    error::EmitError,
    sets::{SetElement, SetStore},
};

use std::sync::Arc;

/// Write access to one rule's nets set, handed to the watcher tasks.
///
/// This is the only way a peer reaches back into its rule: it can edit
/// the nets set and nothing else.
#[derive(Debug)]
pub struct NetsHandle<E> {
    sets: Arc<SetStore<E>>,
    table: String,
    set: String,
}

impl<E> Clone for NetsHandle<E> {
    fn clone(&self) -> Self {
        Self {
            sets: self.sets.clone(),
            table: self.table.clone(),
            set: self.set.clone(),
        }
    }
}

impl<E: Emitter> NetsHandle<E> {
    pub fn new(sets: Arc<SetStore<E>>, table: impl Into<String>, set: impl Into<String>) -> Self {
        Self {
            sets,
            table: table.into(),
            set: set.into(),
        }
    }

    pub async fn add_net(
        &self,
        net: Ipv4Net,
        annotation: Option<String>,
    ) -> Result<(), EmitError> {
        self.sets
            .add_element(&self.table, &self.set, SetElement::Net(net), annotation)
            .await
    }

    pub async fn delete_net(&self, net: Ipv4Net) -> Result<(), EmitError> {
        match self
            .sets
            .delete_element(&self.table, &self.set, &SetElement::Net(net))
            .await
        {
            // Deleting a net that was never added (or was already removed
            // by a concurrent watcher restart) is fine.
            Err(EmitError::NotFound { .. }) => Ok(()),
            other => other,
        }
    }
}

/// One dynamic peer of a rule.
pub struct Peer<E> {
    index: usize,
    spec: PeerSpec,
    nets: NetsHandle<E>,
    client: Client,
    cancel: CancellationToken,
}

impl<E: Emitter> Peer<E> {
    pub fn new(client: Client, nets: NetsHandle<E>, index: usize, spec: PeerSpec) -> Self {
        Self {
            index,
            spec,
            nets,
            client,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the watcher task(s) for this peer.
    pub fn init(&self) {
        let pod_query = self
            .spec
            .pod_selector
            .as_ref()
            .map(|sel| sel.to_query())
            .unwrap_or_default();

        if let Some(ns_selector) = &self.spec.namespace_selector {
            tracing::debug!(index = self.index, "Starting namespace watcher");

            tokio::spawn(watch_namespaces(
                self.client.clone(),
                ns_selector.to_query(),
                pod_query,
                self.nets.clone(),
                self.cancel.child_token(),
            ));
        } else if self.spec.pod_selector.is_some() {
            tracing::debug!(index = self.index, "Starting cluster-wide pod watcher");

            tokio::spawn(watch_pods(
                self.client.clone(),
                None,
                pod_query,
                self.nets.clone(),
                self.cancel.child_token(),
            ));
        }
    }

    /// Ask the watcher tasks to stop. The tasks are detached; they notice
    /// the cancellation at their next suspension point.
    pub fn deinit(&self) {
        self.cancel.cancel();
    }
}

impl<E> Drop for Peer<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Namespace-level watcher: one pod watcher per matching namespace.
async fn watch_namespaces<E: Emitter>(
    client: Client,
    ns_query: String,
    pod_query: String,
    nets: NetsHandle<E>,
    cancel: CancellationToken,
) {
    let api: Api<Namespace> = Api::all(client.clone());
    let config = watcher::Config::default().labels(&ns_query);
    let stream = watcher(api, config).default_backoff();
    let mut stream = std::pin::pin!(stream);

    let mut watchers: HashMap<String, CancellationToken> = HashMap::new();
    let mut relist: Option<HashSet<String>> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };

        match event {
            None => break,
            Some(Err(error)) => {
                tracing::warn!(%error, "Namespace watch error, backing off");
            }
            Some(Ok(watcher::Event::Init)) => {
                relist = Some(HashSet::new());
            }
            Some(Ok(watcher::Event::InitApply(ns) | watcher::Event::Apply(ns))) => {
                let name = ns.name_any();

                if let Some(seen) = relist.as_mut() {
                    seen.insert(name.clone());
                }

                watchers.entry(name.clone()).or_insert_with(|| {
                    tracing::info!(namespace = %name, "Watching pods in matching namespace");

                    let child = cancel.child_token();
                    tokio::spawn(watch_pods(
                        client.clone(),
                        Some(name),
                        pod_query.clone(),
                        nets.clone(),
                        child.clone(),
                    ));
                    child
                });
            }
            Some(Ok(watcher::Event::Delete(ns))) => {
                let name = ns.name_any();

                if let Some(token) = watchers.remove(&name) {
                    tracing::info!(namespace = %name, "Namespace gone, stopping pod watcher");
                    token.cancel();
                }
            }
            Some(Ok(watcher::Event::InitDone)) => {
                if let Some(seen) = relist.take() {
                    watchers.retain(|name, token| {
                        if seen.contains(name) {
                            true
                        } else {
                            token.cancel();
                            false
                        }
                    });
                }
            }
        }
    }

    for token in watchers.values() {
        token.cancel();
    }
}

/// Pod-level watcher, scoped to one namespace or the whole cluster.
async fn watch_pods<E: Emitter>(
    client: Client,
    namespace: Option<String>,
    pod_query: String,
    nets: NetsHandle<E>,
    cancel: CancellationToken,
) {
    let api: Api<Pod> = match &namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let config = watcher::Config::default().labels(&pod_query);
    let stream = watcher(api, config).default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };

        match event {
            None => break,
            Some(Err(error)) => {
                tracing::warn!(%error, "Pod watch error, backing off");
            }
            Some(Ok(watcher::Event::InitApply(pod) | watcher::Event::Apply(pod))) => {
                let Some(net) = pod_net(&pod) else {
                    tracing::debug!(pod = %pod.name_any(), "Pod has no IP address yet, skipping");
                    continue;
                };

                if let Err(error) = nets.add_net(net, Some(pod_annotation(&pod))).await {
                    tracing::warn!(%error, pod = %pod.name_any(), "Failed to add pod IP");
                }
            }
            Some(Ok(watcher::Event::Delete(pod))) => {
                let Some(net) = pod_net(&pod) else {
                    continue;
                };

                if let Err(error) = nets.delete_net(net).await {
                    tracing::warn!(%error, pod = %pod.name_any(), "Failed to remove pod IP");
                }
            }
            Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
        }
    }
}

/// The pod's IP as a /32 network, if it has an IPv4 address assigned.
fn pod_net(pod: &Pod) -> Option<Ipv4Net> {
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
    let addr: std::net::Ipv4Addr = ip.parse().ok()?;

    Some(Ipv4Net::new(addr, 32).expect("/32 is a valid prefix length"))
}

fn pod_annotation(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_default(),
        pod.name_any()
    )
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::{emitter::MockEmitter, nft::SetKind};

    fn pod(namespace: &str, name: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_net_extraction() {
        assert_eq!(
            pod_net(&pod("default", "a", Some("10.1.2.3"))),
            Some("10.1.2.3/32".parse().unwrap())
        );
        assert_eq!(pod_net(&pod("default", "a", None)), None);
        // IPv6 pods yield no IPv4 net
        assert_eq!(pod_net(&pod("default", "a", Some("fd00::1"))), None);
    }

    #[test]
    fn annotation_names_the_pod() {
        assert_eq!(
            pod_annotation(&pod("measurement", "probe-0", Some("10.0.0.1"))),
            "measurement/probe-0"
        );
    }

    #[tokio::test]
    async fn delete_net_swallows_not_found() {
        let mut mock = MockEmitter::new();
        mock.expect_nft().times(1).returning(|_| Ok(serde_json::Value::Null));

        let sets = Arc::new(SetStore::new(Arc::new(mock)));
        sets.create_set("t", "r-nets", SetKind::Ipv4Interval)
            .await
            .unwrap();

        let handle = NetsHandle::new(sets, "t", "r-nets");
        handle
            .delete_net("10.0.0.1/32".parse().unwrap())
            .await
            .unwrap();
    }
}
