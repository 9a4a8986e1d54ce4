//! Hawser Daemon
//!
//! The control plane for a fleet of proxy endpoint and relay nodes: it
//! derives per-relationship credentials, keeps node liveness and bandwidth
//! accounting current, and pushes passage sets to nodes as state changes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use hawser_daemon::config::DaemonConfig;
use hawser_daemon::maintenance;
use hawser_daemon::manager::ManagerRegistry;
use hawser_daemon::server::GrpcServer;
use hawser_daemon::storage::Database;
use hawser_daemon::sync::SyncScheduler;

#[derive(Parser, Debug)]
#[command(name = "hawser-daemon")]
#[command(version, about = "Hawser daemon - proxy fleet control plane")]
struct Args {
    /// TCP bind address for the control API
    #[arg(long, default_value = "127.0.0.1:50061", env = "HAWSER_ADDR")]
    addr: SocketAddr,

    /// Database file path
    #[arg(long, env = "HAWSER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Scheduler tuning file (TOML); defaults apply when omitted
    #[arg(long, env = "HAWSER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "HAWSER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HAWSER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("hawser_daemon={}", args.log_level);
    hawser_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting hawser-daemon"
    );

    let db = if let Some(path) = &args.db_path {
        info!(path = %path.display(), "Opening database");
        Database::open(path).await?
    } else {
        let default_path = default_db_path()?;
        info!(path = %default_path.display(), "Opening database (default path)");
        Database::open(&default_path).await?
    };

    let registry = Arc::new(ManagerRegistry::with_grpc_defaults());
    let sync = SyncScheduler::new(db.clone(), Arc::clone(&registry), config.sync.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Sync loop and slot cleaner
    let sync_handle = {
        let sync = sync.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { sync.run(shutdown).await })
    };
    let cleaner_handle = {
        let sync = sync.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { sync.run_cleaner(shutdown).await })
    };

    // Maintenance: liveness pings plus the two expiry sweeps
    let liveness_handle = maintenance::liveness::spawn_liveness(
        db.clone(),
        Arc::clone(&registry),
        sync.clone(),
        config.maintenance.clone(),
        shutdown_tx.subscribe(),
    );
    let ticket_sweep_handle = maintenance::sweeps::spawn_ticket_sweep(
        db.clone(),
        sync.clone(),
        &config.maintenance,
        shutdown_tx.subscribe(),
    );
    let retirement_handle = maintenance::sweeps::spawn_node_retirement(
        db.clone(),
        sync.clone(),
        &config.maintenance,
        shutdown_tx.subscribe(),
    );

    // Re-push current state to the whole fleet once at boot; nodes may
    // have drifted while the control plane was down.
    {
        let db = db.clone();
        let sync = sync.clone();
        tokio::spawn(async move {
            match db.list_chat_identifiers().await {
                Ok(chats) => {
                    for chat in chats {
                        if let Err(e) =
                            hawser_daemon::sync::request_chat_sync(&db, &sync, &chat).await
                        {
                            tracing::warn!(chat = %chat, error = %e, "Boot sync failed");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Cannot enumerate chats for boot sync"),
            }
        });
    }

    let server = GrpcServer::new(db, registry, sync, config.maintenance.clone());

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %args.addr, "Control API ready");

    tokio::select! {
        result = server.serve_tcp(args.addr, shutdown_rx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in [
        sync_handle,
        cleaner_handle,
        liveness_handle,
        ticket_sweep_handle,
        retirement_handle,
    ] {
        let _ = handle.await;
    }

    info!("Daemon stopped");
    Ok(())
}

/// Default database path: ~/.hawser/control.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".hawser").join("control.db"))
}
