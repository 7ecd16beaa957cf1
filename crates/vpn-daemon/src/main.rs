//! VPN daemon entry point.
//!
//! Loads the configuration, builds the adapters, and runs the session
//! manager until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()            -- TOML file, defaults for anything missing
//!  └─ DaemonParts              -- HTTP API, tunnel backend, device cache
//!  └─ Daemon::start()
//!       ├─ AccessTokenCache
//!       ├─ AccountDirectoryClient
//!       └─ SessionManager      (Tokio task, sole owner of the session)
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpn_daemon::infrastructure::daemon::{Daemon, DaemonParts};
use vpn_daemon::infrastructure::storage::config::load_config;

#[derive(Debug, Parser)]
#[command(name = "vpn-daemon", version, about = "VPN session and tunnel daemon")]
struct Cli {
    /// Configuration file.  Defaults to the platform config directory.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, overrides `daemon.log_level` from the config file.
    #[arg(long, env = "VPN_DAEMON_LOG_LEVEL")]
    log_level: Option<String>,

    /// Run against an in-memory account API and tunnel.  Nothing is
    /// persisted and no network traffic is sent.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!(dry_run = cli.dry_run, "VPN daemon starting");

    let parts = if cli.dry_run {
        DaemonParts::dry_run(&config)
    } else {
        DaemonParts::from_config(&config).context("failed to set up daemon adapters")?
    };
    let daemon = Daemon::start(&config, parts).context("failed to start session manager")?;

    // ── State log ─────────────────────────────────────────────────────────────
    let mut updates = daemon.handle().subscribe();
    tokio::spawn(async move {
        while let Some(snapshot) = updates.recv().await {
            info!(
                revision = snapshot.revision,
                login = ?snapshot.login,
                status = ?snapshot.status,
                "session updated"
            );
        }
    });

    info!("VPN daemon ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("shutdown signal received");

    daemon.shutdown().await.context("session manager shutdown failed")?;
    info!("VPN daemon stopped");
    Ok(())
}
