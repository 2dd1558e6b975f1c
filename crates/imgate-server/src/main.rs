//! imgate - long-connection IM gateway.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use imgate_auth::{JwtConfig, JwtVerifier};
use imgate_server::{GatewayConfig, GatewayServer, LoggingDispatcher, MemoryDirectoryStore, admin};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// How often the standalone store sweeps expired keys.
const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "imgate")]
#[command(about = "Long-connection WebSocket gateway for IM clients")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "IMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }
    if config.auth.jwt_secret.is_none() {
        if let Ok(secret) = std::env::var("IMGATE_JWT_SECRET") {
            config = config.with_jwt_secret(secret);
        }
    }
    config.validate()?;

    init_tracing(&config.log_level, cli.log_json)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.effective_worker_threads())
        .thread_name("imgate-worker")
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(config))
}

fn init_tracing(default_level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("invalid log filter")?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let Some(secret) = config.auth.jwt_secret.as_deref() else {
        bail!("no JWT secret: set auth.jwt_secret or IMGATE_JWT_SECRET");
    };
    let mut jwt = JwtConfig::new_hs256(secret)?.with_leeway_secs(config.auth.leeway_secs);
    if let Some(issuer) = &config.auth.issuer {
        jwt = jwt.with_issuer(issuer.clone());
    }
    if let Some(audience) = &config.auth.audience {
        jwt = jwt.with_audience(audience.clone());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.server.effective_worker_threads(),
        node = %config.node_locator(),
        "starting imgate"
    );

    let store = Arc::new(MemoryDirectoryStore::new());
    let admin_config = config.admin.clone();
    let server = GatewayServer::new(
        config,
        Arc::new(JwtVerifier::new(jwt)),
        Arc::clone(&store) as Arc<dyn imgate_server::DirectoryStore>,
        Arc::new(LoggingDispatcher),
    )?;
    let handle = server.handle();
    let shutdown = handle.shutdown_token();

    let purger = Arc::clone(&store).spawn_purger(STORE_PURGE_INTERVAL, shutdown.clone());

    let admin_task = if admin_config.enabled {
        let admin_handle = handle.clone();
        let addr = admin_config.bind_addr();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = admin::serve(admin_handle, &addr, token).await {
                error!(error = %err, "admin endpoint failed");
            }
        }))
    } else {
        None
    };

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = server.serve().await;
    shutdown.cancel();

    if let Some(task) = admin_task {
        if let Err(err) = task.await {
            warn!(error = %err, "admin task failed");
        }
    }
    if let Err(err) = purger.await {
        warn!(error = %err, "store purger failed");
    }

    result?;
    info!("imgate stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            () = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            () = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}
