//! Label-selector matching and serialisation.
//!
//! Kubernetes evaluates a selector as the conjunction of `matchLabels` and
//! every `matchExpressions` requirement; an empty selector matches every
//! object. The same semantics are reproduced here for the agent's local
//! `match(pod)` check, together with the string form accepted by the API
//! server's `labelSelector` query parameter.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

pub trait LabelSelectorExt {
    /// Whether the selector matches the given label set.
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool;

    /// Serialise to the `labelSelector` query string understood by
    /// list/watch requests.
    fn to_query(&self) -> String;
}

impl LabelSelectorExt for LabelSelector {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if let Some(match_labels) = &self.match_labels {
            for (key, value) in match_labels {
                if labels.get(key) != Some(value) {
                    return false;
                }
            }
        }

        if let Some(exprs) = &self.match_expressions {
            for expr in exprs {
                if !matches_requirement(expr, labels) {
                    return false;
                }
            }
        }

        true
    }

    fn to_query(&self) -> String {
        let mut parts = Vec::new();

        if let Some(match_labels) = &self.match_labels {
            for (key, value) in match_labels {
                parts.push(format!("{key}={value}"));
            }
        }

        if let Some(exprs) = &self.match_expressions {
            for expr in exprs {
                let values = expr.values.as_deref().unwrap_or_default().join(",");

                match expr.operator.as_str() {
                    "In" => parts.push(format!("{} in ({values})", expr.key)),
                    "NotIn" => parts.push(format!("{} notin ({values})", expr.key)),
                    "Exists" => parts.push(expr.key.clone()),
                    "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                    other => tracing::warn!(operator = other, "Unknown selector operator"),
                }
            }
        }

        parts.join(",")
    }
}

fn matches_requirement(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&expr.key);
    let values = expr.values.as_deref().unwrap_or_default();

    match expr.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => !value.is_some_and(|v| values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        other => {
            tracing::warn!(operator = other, "Unknown selector operator");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(json: serde_json::Value) -> LabelSelector {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = LabelSelector::default();

        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn match_labels_are_conjunctive() {
        let sel = selector(serde_json::json!({
            "matchLabels": {"app": "web", "tier": "front"}
        }));

        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "front"), ("extra", "1")])));
        assert!(!sel.matches(&labels(&[("app", "web")])));
        assert!(!sel.matches(&labels(&[("app", "db"), ("tier", "front")])));
    }

    #[rstest]
    #[case("In", Some(vec!["web", "api"]), &[("app", "web")], true)]
    #[case("In", Some(vec!["web", "api"]), &[("app", "db")], false)]
    #[case("In", Some(vec!["web"]), &[], false)]
    #[case("NotIn", Some(vec!["db"]), &[("app", "web")], true)]
    #[case("NotIn", Some(vec!["db"]), &[("app", "db")], false)]
    #[case("NotIn", Some(vec!["db"]), &[], true)]
    #[case("Exists", None, &[("app", "anything")], true)]
    #[case("Exists", None, &[], false)]
    #[case("DoesNotExist", None, &[], true)]
    #[case("DoesNotExist", None, &[("app", "web")], false)]
    fn match_expressions(
        #[case] operator: &str,
        #[case] values: Option<Vec<&str>>,
        #[case] label_pairs: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let sel = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "app".into(),
                operator: operator.into(),
                values: values.map(|vs| vs.into_iter().map(String::from).collect()),
            }]),
            ..Default::default()
        };

        assert_eq!(sel.matches(&labels(label_pairs)), expected);
    }

    #[test]
    fn query_serialisation() {
        let sel = selector(serde_json::json!({
            "matchLabels": {"app": "web"},
            "matchExpressions": [
                {"key": "tier", "operator": "In", "values": ["front", "edge"]},
                {"key": "canary", "operator": "DoesNotExist"},
                {"key": "zone", "operator": "Exists"}
            ]
        }));

        assert_eq!(
            sel.to_query(),
            "app=web,tier in (front,edge),!canary,zone"
        );
    }
}
