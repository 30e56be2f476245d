//! `remote-exec-server`: serves the `execute_command` tool.
//!
//! Run over stdio (for a parent that spawns it):
//!   remote-exec-server --config policy.json
//!
//! Or over HTTP/SSE:
//!   remote-exec-server --config policy.json --transport sse --bind 127.0.0.1:8080

mod watcher;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use remote_exec_core::{Transport, protocol::Implementation};
use remote_exec_executor::{ExecutionEngine, PolicyConfig, PolicyStore};
use remote_exec_session::{RequestHandler, ToolDispatcher, serve};
use remote_exec_transport::{PipeTransport, http::serve_http};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::watcher::{PolicyWatcher, load_policy};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum TransportKind {
    Stdio,
    Sse,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "remote-exec-server", about = "Serve the execute_command tool", version)]
struct Cli {
    /// JSON file holding the `commandPolicy` section; reloaded on change.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transport to serve on.
    #[arg(long, value_enum, default_value_t = TransportKind::Stdio)]
    transport: TransportKind,

    /// Listen address for the SSE transport.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let policy = match &cli.config {
        Some(path) => load_policy(path)?,
        None => PolicyConfig::default(),
    };
    let store = Arc::new(PolicyStore::new(policy));
    let _watcher = cli
        .config
        .as_deref()
        .map(|path| PolicyWatcher::new(path, Arc::clone(&store)))
        .transpose()?;

    let engine = Arc::new(ExecutionEngine::new(store));
    let handler: Arc<dyn RequestHandler> = Arc::new(ToolDispatcher::new(
        engine,
        Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
                return;
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    match cli.transport {
        TransportKind::Stdio => {
            tracing::info!("Serving on stdio");
            let transport = Arc::new(PipeTransport::from_streams(tokio::io::stdin(), tokio::io::stdout()));
            tokio::select! {
                served = serve(Arc::clone(&transport) as Arc<dyn Transport>, handler) => served?,
                () = shutdown.cancelled() => {}
            }
            transport.close().await?;
        }
        TransportKind::Sse => {
            let listener = TcpListener::bind(cli.bind)
                .await
                .with_context(|| format!("failed to bind {}", cli.bind))?;
            serve_http(listener, handler, shutdown).await?;
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Logs go to stderr; stdout may be the protocol stream.
fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}
