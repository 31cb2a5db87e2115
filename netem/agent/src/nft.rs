//! Typed model of the libnftables JSON dialect.
//!
//! Only the small slice of the grammar the agent emits is modelled:
//! tables, base chains, sets, mark-mangling rules and set elements.
//! Everything serialises to the exact shape `nft -j` expects.

use serde::Serialize;
use serde_json::{json, Value};

/// Address family all agent tables live in.
pub const FAMILY: &str = "inet";

/// Prefix of the per-profile tables.
pub const TABLE_PREFIX: &str = "k8s-netem";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NftCommand {
    Add(NftObject),
    Delete(NftObject),
    List(NftObject),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NftObject {
    Table(Table),
    Chain(Chain),
    Set(Set),
    Rule(Rule),
    Element(Element),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Table {
    pub family: &'static str,
    pub name: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            family: FAMILY,
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Chain {
    pub family: &'static str,
    pub table: String,
    pub name: String,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub chain_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prio: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<&'static str>,
}

impl Chain {
    /// A base chain of type filter attached to the given hook.
    pub fn base(table: impl Into<String>, name: impl Into<String>, hook: &'static str) -> Self {
        Self {
            family: FAMILY,
            table: table.into(),
            name: name.into(),
            chain_type: Some("filter"),
            hook: Some(hook),
            prio: Some(0),
            policy: Some("accept"),
        }
    }

    /// Reference to an existing chain, as used by delete and list.
    pub fn named(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            family: FAMILY,
            table: table.into(),
            name: name.into(),
            chain_type: None,
            hook: None,
            prio: None,
            policy: None,
        }
    }
}

/// Element type of a named set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetKind {
    /// IPv4 networks, stored as intervals.
    Ipv4Interval,
    /// Link-layer protocol constants.
    EtherType,
    /// Transport protocol constants.
    InetProto,
    /// `(transport protocol, port)` pairs.
    ProtoPort,
}

impl SetKind {
    fn type_value(&self) -> Value {
        match self {
            SetKind::Ipv4Interval => json!("ipv4_addr"),
            SetKind::EtherType => json!("ether_type"),
            SetKind::InetProto => json!("inet_proto"),
            SetKind::ProtoPort => json!(["inet_proto", "inet_service"]),
        }
    }

    fn flags(&self) -> Option<Vec<&'static str>> {
        match self {
            SetKind::Ipv4Interval => Some(vec!["interval"]),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Set {
    pub family: &'static str,
    pub table: String,
    pub name: String,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub set_type: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<&'static str>>,
}

impl Set {
    pub fn typed(table: impl Into<String>, name: impl Into<String>, kind: SetKind) -> Self {
        Self {
            family: FAMILY,
            table: table.into(),
            name: name.into(),
            set_type: Some(kind.type_value()),
            flags: kind.flags(),
        }
    }

    pub fn named(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            family: FAMILY,
            table: table.into(),
            name: name.into(),
            set_type: None,
            flags: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Rule {
    pub family: &'static str,
    pub table: String,
    pub chain: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<Vec<Expression>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<u64>,
}

impl Rule {
    pub fn new(
        table: impl Into<String>,
        chain: impl Into<String>,
        expr: Vec<Expression>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            family: FAMILY,
            table: table.into(),
            chain: chain.into(),
            expr: Some(expr),
            comment: Some(comment.into()),
            handle: None,
        }
    }

    pub fn by_handle(table: impl Into<String>, chain: impl Into<String>, handle: u64) -> Self {
        Self {
            family: FAMILY,
            table: table.into(),
            chain: chain.into(),
            expr: None,
            comment: None,
            handle: Some(handle),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Element {
    pub family: &'static str,
    pub table: String,
    pub name: String,
    pub elem: Vec<Value>,
}

impl Element {
    pub fn new(table: impl Into<String>, name: impl Into<String>, elem: Vec<Value>) -> Self {
        Self {
            family: FAMILY,
            table: table.into(),
            name: name.into(),
            elem,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    Match(Match),
    Mangle(Mangle),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Match {
    pub left: Value,
    pub right: Value,
    pub op: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mangle {
    pub key: Value,
    pub value: Value,
}

/// `meta <key>` selector.
pub fn meta(key: &str) -> Value {
    json!({ "meta": { "key": key } })
}

/// `<protocol> <field>` payload selector.
pub fn payload(protocol: &str, field: &str) -> Value {
    json!({ "payload": { "protocol": protocol, "field": field } })
}

/// Membership test of `left` against the named set.
pub fn match_set(left: Value, set: &str) -> Expression {
    Expression::Match(Match {
        left,
        right: Value::from(format!("@{set}")),
        op: "==",
    })
}

/// `meta mark set <mark>`.
pub fn mangle_mark(mark: u32) -> Expression {
    Expression::Mangle(Mangle {
        key: meta("mark"),
        value: Value::from(mark),
    })
}

/// Scan `nft list chain` output for the handle of the rule carrying the
/// given comment.
pub fn find_rule_handle(output: &Value, comment: &str) -> Option<u64> {
    let entries = output.get("nftables")?.as_array()?;

    entries.iter().find_map(|entry| {
        let rule = entry.get("rule")?;

        if rule.get("comment")?.as_str()? != comment {
            return None;
        }

        rule.get("handle")?.as_u64()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json(cmd: &NftCommand) -> Value {
        serde_json::to_value(cmd).unwrap()
    }

    #[test]
    fn add_table() {
        let cmd = NftCommand::Add(NftObject::Table(Table::new("k8s-netem-p1")));

        assert_eq!(
            to_json(&cmd),
            json!({ "add": { "table": { "family": "inet", "name": "k8s-netem-p1" } } })
        );
    }

    #[test]
    fn add_base_chain() {
        let cmd = NftCommand::Add(NftObject::Chain(Chain::base(
            "k8s-netem-p1",
            "egress",
            "output",
        )));

        assert_eq!(
            to_json(&cmd),
            json!({ "add": { "chain": {
                "family": "inet",
                "table": "k8s-netem-p1",
                "name": "egress",
                "type": "filter",
                "hook": "output",
                "prio": 0,
                "policy": "accept",
            } } })
        );
    }

    #[test]
    fn add_interval_set() {
        let cmd = NftCommand::Add(NftObject::Set(Set::typed(
            "k8s-netem-p1",
            "egress-0-abcdef-nets",
            SetKind::Ipv4Interval,
        )));

        assert_eq!(
            to_json(&cmd),
            json!({ "add": { "set": {
                "family": "inet",
                "table": "k8s-netem-p1",
                "name": "egress-0-abcdef-nets",
                "type": "ipv4_addr",
                "flags": ["interval"],
            } } })
        );
    }

    #[test]
    fn add_concat_set() {
        let cmd = NftCommand::Add(NftObject::Set(Set::typed(
            "t",
            "ports",
            SetKind::ProtoPort,
        )));

        assert_eq!(
            to_json(&cmd),
            json!({ "add": { "set": {
                "family": "inet",
                "table": "t",
                "name": "ports",
                "type": ["inet_proto", "inet_service"],
            } } })
        );
    }

    #[test]
    fn marking_rule() {
        let expr = vec![
            match_set(payload("ip", "daddr"), "r-nets"),
            match_set(
                json!({ "concat": [meta("l4proto"), payload("th", "dport")] }),
                "r-ports",
            ),
            mangle_mark(1000),
        ];
        let cmd = NftCommand::Add(NftObject::Rule(Rule::new("t", "egress", expr, "egress-0-x")));

        assert_eq!(
            to_json(&cmd),
            json!({ "add": { "rule": {
                "family": "inet",
                "table": "t",
                "chain": "egress",
                "comment": "egress-0-x",
                "expr": [
                    { "match": {
                        "left": { "payload": { "protocol": "ip", "field": "daddr" } },
                        "right": "@r-nets",
                        "op": "==",
                    } },
                    { "match": {
                        "left": { "concat": [
                            { "meta": { "key": "l4proto" } },
                            { "payload": { "protocol": "th", "field": "dport" } },
                        ] },
                        "right": "@r-ports",
                        "op": "==",
                    } },
                    { "mangle": {
                        "key": { "meta": { "key": "mark" } },
                        "value": 1000,
                    } },
                ],
            } } })
        );
    }

    #[test]
    fn delete_rule_by_handle() {
        let cmd = NftCommand::Delete(NftObject::Rule(Rule::by_handle("t", "egress", 42)));

        assert_eq!(
            to_json(&cmd),
            json!({ "delete": { "rule": {
                "family": "inet",
                "table": "t",
                "chain": "egress",
                "handle": 42,
            } } })
        );
    }

    #[test]
    fn handle_lookup_by_comment() {
        let output = json!({ "nftables": [
            { "metainfo": { "version": "1.0.2" } },
            { "chain": { "family": "inet", "table": "t", "name": "egress" } },
            { "rule": {
                "family": "inet",
                "table": "t",
                "chain": "egress",
                "handle": 7,
                "comment": "egress-0-aaaaaa",
                "expr": [],
            } },
            { "rule": {
                "family": "inet",
                "table": "t",
                "chain": "egress",
                "handle": 9,
                "comment": "egress-1-bbbbbb",
                "expr": [],
            } },
        ] });

        assert_eq!(find_rule_handle(&output, "egress-1-bbbbbb"), Some(9));
        assert_eq!(find_rule_handle(&output, "egress-2-cccccc"), None);
    }
}
