//! Environment toggles of the sidecar.

use crate::error::{AgentError, AgentResult};

pub const POD_NAME: &str = "POD_NAME";
pub const POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const DEBUG: &str = "DEBUG";

fn flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("on")
    )
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Name of the pod this sidecar runs in, set through the downward API.
pub fn pod_name() -> AgentResult<String> {
    std::env::var(POD_NAME).map_err(|_| AgentError::MissingEnv(POD_NAME))
}

pub fn pod_namespace() -> AgentResult<String> {
    std::env::var(POD_NAMESPACE).map_err(|_| AgentError::MissingEnv(POD_NAMESPACE))
}

/// Raises the default log level to debug.
pub fn debug() -> bool {
    flag(DEBUG)
}

pub fn flexe_host() -> String {
    var_or("FLEXE_HOST", "127.0.0.1")
}

pub fn flexe_rest_port() -> u16 {
    var_or("FLEXE_REST_PORT", "8080").parse().unwrap_or(8080)
}

pub fn flexe_ws_port() -> u16 {
    var_or("FLEXE_WS_PORT", "8888").parse().unwrap_or(8888)
}

pub fn flexe_user() -> String {
    var_or("FLEXE_USER", "flexe")
}

pub fn flexe_password() -> String {
    var_or("FLEXE_PASSWORD", "")
}
