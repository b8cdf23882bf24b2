//! vncdesk server
//!
//! Serves the management API and VNC WebSocket proxy, and runs the
//! liveness prober in the background.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vncdesk_common::Database;
use vncdesk_web::server::supervise;
use vncdesk_web::{LivenessProber, ServerConfig, WebServer};

#[derive(Parser)]
#[command(name = "vncdesk-web")]
#[command(about = "vncdesk - VNC endpoint management server")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VNCDESK_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "VNCDESK_LISTEN")]
    listen: Option<SocketAddr>,

    /// State database path
    #[arg(long, env = "VNCDESK_DB")]
    db: Option<PathBuf>,

    /// Public URL embedded in installer scripts
    #[arg(long, env = "VNCDESK_PUBLIC_URL")]
    public_url: Option<String>,

    /// Bearer token for the management API
    #[arg(long, env = "VNCDESK_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Seconds between liveness probe cycles
    #[arg(long)]
    probe_interval: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("vncdesk v{}", vncdesk_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(|| vncdesk_common::default_store_path().join("config.toml"));
    let mut config = ServerConfig::load(&config_path)?;

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(url) = cli.public_url {
        config.public_url = url;
    }
    if let Some(token) = cli.api_token.filter(|t| !t.trim().is_empty()) {
        config.api_token = Some(token);
    }
    if let Some(secs) = cli.probe_interval {
        config.probe.interval_secs = secs;
    }
    config.validate()?;

    if config.api_token.is_none() {
        info!("No API token configured, management routes are open");
    }

    let db = Database::open(&config.db_path)?;
    info!("State database at {}", config.db_path.display());

    let listen = config.listen;
    let prober_config = config.prober();
    let server = WebServer::new(config, db);

    let cancel = CancellationToken::new();
    let prober = LivenessProber::new(
        server.registry().clone(),
        server.activity().clone(),
        prober_config,
    );
    let prober_handle = prober.spawn(cancel.child_token());

    let listener = TcpListener::bind(listen).await?;

    let shutdown = cancel.clone();
    let serve_handle = tokio::spawn(server.serve(listener, async move {
        shutdown.cancelled().await;
    }));

    supervise(serve_handle, prober_handle, cancel, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("Shutdown complete");
    Ok(())
}
