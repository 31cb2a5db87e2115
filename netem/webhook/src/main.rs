//! Mutating admission webhook injecting the netem sidecar.
//!
//! Pods matched by at least one live TrafficProfile (or all pods when
//! `INJECT_TO_ALL` is set) get a `k8s-netem` container appended through a
//! JSON patch. Serves TLS when the certificate pair exists, plain HTTP
//! otherwise.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use clap::Parser;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    service::TowerToHyperService,
};
use kube::Client;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

mod mutate;
mod tls;

use mutate::{InjectionConfig, MutateState};

pub type WebhookResult<T> = Result<T, WebhookError>;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("bad certificate material: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}

const SERVICE_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Parser, Debug)]
#[command(name = "k8s-netem-webhook", about = "Sidecar injection webhook")]
struct Args {
    /// TLS certificate; plain HTTP is served when the file is missing.
    #[arg(long, env = "SSL_CERT_FILE", default_value = "/certs/tls.crt")]
    cert: PathBuf,

    #[arg(long, env = "SSL_KEY_FILE", default_value = "/certs/tls.key")]
    key: PathBuf,

    /// Image of the injected sidecar container.
    #[arg(long, env = "NETEM_IMAGE", default_value = "erigrid/netem")]
    image: String,
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("on")
    )
}

fn init_tracing() {
    let default_level = if env_flag("DEBUG") { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[tokio::main]
async fn main() -> WebhookResult<()> {
    let args = Args::parse();

    init_tracing();

    tracing::info!("Started mutating webhook server");

    let client = Client::try_default().await?;

    let token = match tokio::fs::read_to_string(SERVICE_TOKEN_FILE).await {
        Ok(token) => Some(token.trim().to_string()),
        Err(error) => {
            tracing::warn!(%error, "No service account token, injected sidecars get none");
            None
        }
    };

    let state = MutateState {
        client,
        config: Arc::new(InjectionConfig {
            image: args.image,
            inject_to_all: env_flag("INJECT_TO_ALL"),
            debug: env_flag("DEBUG"),
            token,
        }),
    };

    let app = Router::new()
        .route("/mutate", post(mutate::mutate))
        .route("/health", get(health))
        .with_state(state);

    if args.cert.is_file() {
        let tls_config = tls::server_config(&args.cert, &args.key)?;
        let addr: SocketAddr = ([0, 0, 0, 0], 443).into();

        tracing::info!(%addr, "Serving with TLS");
        serve_tls(addr, tls_config, app).await
    } else {
        let addr: SocketAddr = ([0, 0, 0, 0], 5000).into();
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!(%addr, "Serving plain HTTP");
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn serve_tls(
    addr: SocketAddr,
    tls_config: Arc<tokio_rustls::rustls::ServerConfig>,
    app: Router,
) -> WebhookResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::debug!(%error, %peer, "TLS handshake failed");
                    return;
                }
            };

            let service = TowerToHyperService::new(app);
            if let Err(error) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(%error, %peer, "Connection error");
            }
        });
    }
}
