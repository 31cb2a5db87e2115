use netem_crd::ControllerKind;
use thiserror::Error;

pub type AgentResult<T, E = AgentError> = Result<T, E>;

/// Failures surfaced by the command emitter.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("command `{command}` failed with rc {rc}: {stderr}")]
    Command {
        command: String,
        rc: i32,
        stderr: String,
    },

    #[error("command `{command}` timed out")]
    Timeout { command: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no such set: {0}")]
    UnknownSet(String),

    #[error("element not found in set {set}")]
    NotFound { set: String },

    #[error("unparsable nft output: {0}")]
    Output(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(
        "profile {profile} rejected: controller type {requested} conflicts \
         with {existing} already driving {interface}"
    )]
    ControllerConflict {
        interface: String,
        existing: ControllerKind,
        requested: ControllerKind,
        profile: String,
    },

    #[error("failed to create root qdisc on {interface}: {source}")]
    Unrecoverable {
        interface: String,
        #[source]
        source: EmitError,
    },

    #[error("profile watch stream closed")]
    StreamClosed,

    #[error("profile already known: {0}")]
    DuplicateProfile(String),

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("remote engine protocol error: {0}")]
    Protocol(String),

    #[error("invalid CIDR in ipBlock: {0}")]
    Cidr(#[from] ipnet::AddrParseError),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("no usable network interface found")]
    NoInterface,
}
