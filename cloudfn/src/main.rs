//! cloudfn - minimal function-as-a-service server
//!
//! Stores user functions written for Go, Node.js or Python and runs them on
//! demand as child processes.

mod config;
mod router;

use anyhow::Context;
use clap::Parser;
use cloudfn_functions::{FunctionRegistry, FunctionService, FunctionsState, Metrics, ProcessExecutor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "cloudfn")]
#[command(about = "Minimal function-as-a-service server", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./cloudfn.toml when present)
    #[arg(short, long, env = "CLOUDFN_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CLOUDFN_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CLOUDFN_HOST")]
    host: Option<String>,

    /// Directory holding function sources and the registry snapshot
    #[arg(long, env = "CLOUDFN_FUNCTIONS_DIR")]
    functions_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CLOUDFN_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(dir) = self.functions_dir {
            config.storage.functions_dir = dir;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Initialize tracing
    let level = config.log.level.to_ascii_lowercase();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("cloudfn={level},tower_http={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cloudfn...");
    info!("  Functions: {}", config.storage.functions_dir.display());
    info!("  Snapshot: {}", config.snapshot_path().display());
    info!(
        "  Runtimes: {:?} (max {} concurrent)",
        config.runtime.enabled_runtimes, config.runtime.max_concurrent
    );

    // Build services
    let registry = FunctionRegistry::open(&config.storage.functions_dir, config.snapshot_path())
        .context("failed to open function registry")?;
    let executor = ProcessExecutor::new(config.executor_config());
    let metrics = Arc::new(Metrics::new());
    let service = FunctionService::new(registry, executor, metrics, config.service_limits()?);

    // Create router
    let app = router::create_router(Arc::new(FunctionsState::new(service)));

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
