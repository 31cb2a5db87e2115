//! Process setup: CLI, logging, cluster client, signal handling.

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::{
    context::Ctx,
    emitter::CommandEmitter,
    env,
    error::AgentResult,
    reconciler::Reconciler,
    sets::SetStore,
    util,
};

#[derive(Parser, Debug)]
#[command(name = "k8s-netem-agent", about = "Network impairment sidecar")]
pub struct Args {
    /// Interface to impair when a profile does not name one. Defaults to
    /// the first non-loopback interface.
    #[arg(long, env = "INTERFACE")]
    pub interface: Option<String>,
}

fn init_tracing() {
    let default_level = if env::debug() { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run() -> AgentResult<()> {
    let args = Args::parse();

    init_tracing();

    tracing::info!("Started netem sidecar");

    // KUBECONFIG selects out-of-cluster auth, otherwise the in-cluster
    // service account is used.
    let client = Client::try_default().await?;

    let namespace = env::pod_namespace()?;
    let pod_name = env::pod_name()?;
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let self_pod = pods.get(&pod_name).await?;

    let interface = match args.interface {
        Some(interface) => interface,
        None => util::default_interface()?,
    };
    tracing::info!(interface, "Default impairment interface");

    let emitter = Arc::new(CommandEmitter::new());
    let ctx = Ctx {
        sets: Arc::new(SetStore::new(emitter.clone())),
        emitter,
        client,
    };

    let cancel = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }

        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    Reconciler::new(ctx, self_pod, interface).run(cancel).await
}
