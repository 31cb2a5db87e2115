//! k8s-netem sidecar agent.
//!
//! Watches cluster TrafficProfile resources and programs the pod's
//! nftables and traffic-control state accordingly.

mod context;
mod controller;
mod direction;
mod emitter;
mod entrypoint;
mod env;
mod error;
mod nft;
mod peer;
mod profile;
mod reconciler;
mod rule;
mod sets;
mod util;

use error::AgentResult;

#[tokio::main]
async fn main() -> AgentResult<()> {
    entrypoint::run().await
}
