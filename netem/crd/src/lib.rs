//! Types for the `TrafficProfile` custom resource.
//!
//! A `TrafficProfile` is a cluster-scoped object that selects pods via a
//! label selector and describes how traffic from/to a set of peers should
//! be impaired. The sidecar agent watches these objects and translates
//! them into packet classification and queueing state on the pod's
//! network interface.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod selector;

pub const GROUP: &str = "k8s-netem.riasc.io";
pub const VERSION: &str = "v1";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s-netem.riasc.io",
    version = "v1",
    kind = "TrafficProfile",
    plural = "trafficprofiles"
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficProfileSpec {
    /// Which controller implementation drives this profile.
    #[serde(rename = "type", default)]
    pub controller: ControllerKind,

    /// Target network device. The first non-loopback interface of the pod
    /// is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Pods this profile applies to. An empty selector matches all pods.
    #[serde(default)]
    pub pod_selector: LabelSelector,

    /// Ordered rules classifying traffic received by the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<RuleSpec>>,

    /// Ordered rules classifying traffic sent by the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<Vec<RuleSpec>>,

    /// Impairment parameters, interpreted by the selected controller only.
    /// For the `Builtin` controller this holds a `netem` block.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Controller implementations a profile can select.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ControllerKind {
    #[default]
    Builtin,
    Script,
    Flexe,
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerKind::Builtin => write!(f, "Builtin"),
            ControllerKind::Script => write!(f, "Script"),
            ControllerKind::Flexe => write!(f, "Flexe"),
        }
    }
}

/// One selector clause inside a direction.
///
/// `from` is only meaningful on ingress rules, `to` on egress rules.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<PeerSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<PeerSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    /// Link-layer protocol constants, by name (`ip`, `arp`, ...) or number.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ether_types: Vec<ProtoConst>,

    /// Transport protocol constants, by name (`tcp`, `udp`, ...) or number.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inet_protos: Vec<ProtoConst>,
}

impl RuleSpec {
    /// Peer list for the direction this rule lives in.
    pub fn peers(&self, ingress: bool) -> &[PeerSpec] {
        if ingress {
            &self.from
        } else {
            &self.to
        }
    }
}

/// One element of a rule's `from`/`to` list.
///
/// Exactly one of `ip_block` or the selector pair is expected. A peer with
/// selectors is dynamic: the agent tracks the IPs of matching pods over
/// time.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
}

impl PeerSpec {
    pub fn is_dynamic(&self) -> bool {
        self.namespace_selector.is_some() || self.pod_selector.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpBlock {
    pub cidr: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl PortSpec {
    /// Protocol defaults to TCP, like a NetworkPolicy port.
    pub fn protocol(&self) -> Protocol {
        self.protocol.unwrap_or(Protocol::Tcp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "SCTP")]
    Sctp,
}

impl Protocol {
    /// Lowercase name as used by nftables.
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// A protocol constant given either by its well-known name or its number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum ProtoConst {
    Number(u32),
    Name(String),
}

impl ProtoConst {
    /// The constant as a bare nftables JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ProtoConst::Number(n) => serde_json::Value::from(*n),
            ProtoConst::Name(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults() {
        let spec: TrafficProfileSpec = serde_json::from_value(serde_json::json!({
            "podSelector": {}
        }))
        .unwrap();

        assert_eq!(spec.controller, ControllerKind::Builtin);
        assert!(spec.interface.is_none());
        assert!(spec.ingress.is_none());
        assert!(spec.egress.is_none());
        assert!(spec.parameters.is_null());
    }

    #[test]
    fn full_spec_roundtrip() {
        let spec: TrafficProfileSpec = serde_json::from_value(serde_json::json!({
            "type": "Flexe",
            "interface": "eth0",
            "podSelector": {
                "matchLabels": {"app": "measurement"}
            },
            "egress": [{
                "to": [
                    {"ipBlock": {"cidr": "10.0.0.0/8"}},
                    {"podSelector": {"matchLabels": {"role": "peer"}}}
                ],
                "ports": [{"port": 80}, {"port": 53, "protocol": "UDP"}],
                "etherTypes": ["ip", 2054],
                "inetProtos": ["tcp", 17]
            }],
            "parameters": {"flexe": {"profile": "lte-handover"}}
        }))
        .unwrap();

        assert_eq!(spec.controller, ControllerKind::Flexe);
        assert_eq!(spec.interface.as_deref(), Some("eth0"));

        let rules = spec.egress.as_ref().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].peers(false).len(), 2);
        assert!(rules[0].to[0].ip_block.is_some());
        assert!(rules[0].to[1].is_dynamic());
        assert_eq!(rules[0].ports[0].protocol(), Protocol::Tcp);
        assert_eq!(rules[0].ports[1].protocol(), Protocol::Udp);
        assert_eq!(
            rules[0].ether_types,
            vec![
                ProtoConst::Name("ip".into()),
                ProtoConst::Number(2054),
            ]
        );
    }

    #[test]
    fn peers_follow_direction() {
        let rule: RuleSpec = serde_json::from_value(serde_json::json!({
            "from": [{"ipBlock": {"cidr": "192.168.0.0/16"}}]
        }))
        .unwrap();

        assert_eq!(rule.peers(true).len(), 1);
        assert!(rule.peers(false).is_empty());
    }
}
