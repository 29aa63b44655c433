//! causewayd: accepts control-plane connections on a Unix socket and
//! serves each with its own isolated WebRTC proxy engine.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::{UnixListener, UnixStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use causeway_core::{supervisor, InterfaceServer, WebrtcState, WebrtcStateConfig};

#[derive(Parser, Debug)]
#[command(name = "causewayd", about = "WebRTC proxy daemon")]
struct Args {
    /// Control socket path. Defaults to $RUNTIME_DIRECTORY/causeway.sock.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// ICE server URL for the default peer configuration.
    #[arg(long, default_value = "stun:stun.l.google.com:19302")]
    ice_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "causewayd=info,causeway_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let socket_path = match &args.socket {
        Some(path) => path.clone(),
        None => {
            let runtime_dir = std::env::var("RUNTIME_DIRECTORY")
                .context("RUNTIME_DIRECTORY is not set and --socket was not given")?;
            PathBuf::from(runtime_dir).join("causeway.sock")
        }
    };
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to listen on {}", socket_path.display()))?;
    tracing::info!("serving control sessions on {}", socket_path.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("accept failed")?;
                let ice_url = args.ice_url.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, ice_url).await {
                        tracing::warn!("control session ended with error: {err}");
                    }
                });
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, ice_url: String) -> anyhow::Result<()> {
    let config = WebrtcStateConfig::with_ice_urls(vec![ice_url]);
    let (state, events) = WebrtcState::new(config)?;
    let (server, server_errors) = InterfaceServer::new(state.clone());
    tracing::info!("control session opened, engine {}", state.src_uuid());
    let result =
        supervisor::run_session(stream, state.clone(), events, server.clone(), server_errors)
            .await;
    server.close().await;
    state.close().await;
    tracing::info!("control session closed, engine {}", state.src_uuid());
    result.map_err(Into::into)
}
