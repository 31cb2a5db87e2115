//! The `/mutate` handler and the sidecar injection patch.

use std::sync::Arc;

use axum::{extract::State, Json};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::ListParams,
    core::admission::{AdmissionRequest, AdmissionReview},
    Api, Client, ResourceExt,
};
use netem_crd::{selector::LabelSelectorExt, TrafficProfile};
use serde_json::{json, Value};

pub const SIDECAR_NAME: &str = "k8s-netem";

#[derive(Clone, Debug)]
pub struct InjectionConfig {
    pub image: String,
    pub inject_to_all: bool,
    pub debug: bool,
    pub token: Option<String>,
}

#[derive(Clone)]
pub struct MutateState {
    pub client: Client,
    pub config: Arc<InjectionConfig>,
}

fn review(response: Value) -> Json<Value> {
    Json(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": response,
    }))
}

pub async fn mutate(
    State(state): State<MutateState>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<Value> {
    let request: AdmissionRequest<Pod> = match body.try_into() {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(%error, "Malformed admission review");
            return review(json!({
                "allowed": false,
                "status": { "message": error.to_string() },
            }));
        }
    };

    let mut response = json!({
        "allowed": true,
        "uid": request.uid,
    });

    if let Some(pod) = &request.object {
        let profiles = match list_profiles(&state.client).await {
            Ok(profiles) => profiles,
            Err(error) => {
                tracing::error!(%error, "Failed to list profiles, admitting pod unchanged");
                return review(response);
            }
        };

        if let Some(operations) = injection_patch(pod, &profiles, &state.config) {
            tracing::info!(pod = %pod.name_any(), "Injecting netem sidecar");

            response["patch"] = Value::from(BASE64.encode(operations.to_string()));
            response["patchType"] = Value::from("JSONPatch");
        }
    }

    review(response)
}

async fn list_profiles(client: &Client) -> kube::Result<Vec<TrafficProfile>> {
    let api: Api<TrafficProfile> = Api::all(client.clone());

    Ok(api.list(&ListParams::default()).await?.items)
}

/// JSON-patch operations appending the sidecar container, or `None` when
/// the pod needs no injection.
pub fn injection_patch(
    pod: &Pod,
    profiles: &[TrafficProfile],
    config: &InjectionConfig,
) -> Option<Value> {
    let labels = pod.metadata.labels.clone().unwrap_or_default();

    let has_profile = profiles
        .iter()
        .any(|profile| profile.spec.pod_selector.matches(&labels));

    let has_sidecar = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.iter().any(|c| c.name == SIDECAR_NAME))
        .unwrap_or(false);

    if !(config.inject_to_all || (has_profile && !has_sidecar)) {
        return None;
    }

    let mut env = vec![
        json!({
            "name": "POD_NAME",
            "valueFrom": { "fieldRef": { "fieldPath": "metadata.name" } },
        }),
        json!({
            "name": "POD_NAMESPACE",
            "valueFrom": { "fieldRef": { "fieldPath": "metadata.namespace" } },
        }),
    ];

    if let Some(token) = &config.token {
        env.push(json!({ "name": "KUBETOKEN", "value": token }));
    }

    if config.debug {
        env.push(json!({ "name": "DEBUG", "value": "1" }));
    }

    let container = json!({
        "name": SIDECAR_NAME,
        "image": config.image,
        "imagePullPolicy": "Always",
        "env": env,
        "securityContext": {
            "capabilities": { "add": ["NET_ADMIN"] },
        },
    });

    Some(json!([
        { "op": "add", "path": "/spec/containers/-", "value": container },
    ]))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kube::api::ObjectMeta;
    use netem_crd::TrafficProfileSpec;

    use super::*;

    fn config() -> InjectionConfig {
        InjectionConfig {
            image: "erigrid/netem".into(),
            inject_to_all: false,
            debug: false,
            token: Some("secret".into()),
        }
    }

    fn pod(labels: &[(&str, &str)], containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("workload".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn profile(selector: serde_json::Value) -> TrafficProfile {
        let spec: TrafficProfileSpec =
            serde_json::from_value(json!({ "podSelector": selector })).unwrap();

        TrafficProfile::new("p1", spec)
    }

    #[test]
    fn matching_pod_gets_the_sidecar() {
        let profiles = vec![profile(json!({"matchLabels": {"app": "dut"}}))];
        let patch = injection_patch(&pod(&[("app", "dut")], &["app"]), &profiles, &config());

        let ops = patch.expect("pod should be mutated");

        assert_eq!(ops[0]["op"], "add");
        assert_eq!(ops[0]["path"], "/spec/containers/-");
        assert_eq!(ops[0]["value"]["name"], SIDECAR_NAME);
        assert_eq!(ops[0]["value"]["image"], "erigrid/netem");
        assert_eq!(
            ops[0]["value"]["securityContext"]["capabilities"]["add"][0],
            "NET_ADMIN"
        );

        let env = ops[0]["value"]["env"].as_array().unwrap();
        assert!(env.iter().any(|e| e["name"] == "POD_NAME"));
        assert!(env.iter().any(|e| e["name"] == "POD_NAMESPACE"));
        assert!(env.iter().any(|e| e["name"] == "KUBETOKEN"));
    }

    #[test]
    fn non_matching_pod_is_left_alone() {
        let profiles = vec![profile(json!({"matchLabels": {"app": "dut"}}))];

        assert!(
            injection_patch(&pod(&[("app", "other")], &["app"]), &profiles, &config()).is_none()
        );
    }

    #[test]
    fn existing_sidecar_is_not_duplicated() {
        let profiles = vec![profile(json!({"matchLabels": {"app": "dut"}}))];

        assert!(injection_patch(
            &pod(&[("app", "dut")], &["app", SIDECAR_NAME]),
            &profiles,
            &config()
        )
        .is_none());
    }

    #[test]
    fn inject_to_all_overrides_matching() {
        let mut config = config();
        config.inject_to_all = true;

        assert!(injection_patch(&pod(&[], &["app"]), &[], &config).is_some());
    }

    #[test]
    fn debug_env_is_passed_through() {
        let mut config = config();
        config.debug = true;

        let profiles = vec![profile(json!({}))];
        let ops = injection_patch(&pod(&[], &["app"]), &profiles, &config).unwrap();

        let env = ops[0]["value"]["env"].as_array().unwrap();
        assert!(env.iter().any(|e| e["name"] == "DEBUG" && e["value"] == "1"));
    }

    #[test]
    fn missing_token_is_omitted_from_env() {
        let mut config = config();
        config.token = None;

        let profiles = vec![profile(json!({}))];
        let ops = injection_patch(&pod(&[], &["app"]), &profiles, &config).unwrap();

        let env = ops[0]["value"]["env"].as_array().unwrap();
        assert!(!env.iter().any(|e| e["name"] == "KUBETOKEN"));
    }
}
