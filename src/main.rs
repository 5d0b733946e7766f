//! vpn-watchdog
//!
//! Probes sites through a WireGuard tunnel and fails over to another peer
//! when the egress path looks blocked.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vpn_watchdog::config;
use vpn_watchdog::cron;
use vpn_watchdog::rpc::{self, cli};
use vpn_watchdog::watchdog::PassLock;
use vpn_watchdog::{Commands, ControlPlane, PeerCommands, RpcCommands};

/// VPN connectivity watchdog with peer failover
#[derive(Parser)]
#[command(name = "vpn-watchdog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path (defaults to $VPN_WATCHDOG_CONFIG or /etc/vpn-watchdog/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // stdout carries rpc JSON, so diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .compact()
        .init();

    let config_path = config::resolve_config_path(args.config.as_deref());

    if let Commands::Watch = args.command {
        return watch(&config_path).await;
    }

    let plane = match ControlPlane::open(&config_path) {
        Ok(plane) => plane,
        // rpcd expects a JSON object even when the config is unreadable.
        Err(e) if matches!(args.command, Commands::Rpc { command: RpcCommands::Call { .. } }) => {
            println!("{}", rpc::error_reply(&e));
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to load {}", config_path.display()))
        }
    };

    match args.command {
        Commands::Run {
            dry_run,
            scheduled,
            json,
        } => cli::handle_run(&plane, dry_run, scheduled, json).await,
        Commands::Status { json } => cli::handle_status(&plane, json),
        Commands::Log { lines } => cli::handle_log(&plane, lines).await,
        Commands::Peers { command } => {
            cli::handle_peers_command(&plane, command.unwrap_or(PeerCommands::List)).await
        }
        Commands::Sites { command } => cli::handle_sites_command(&plane, command).await,
        Commands::ApplyCron => cli::handle_apply_cron(&plane).await,
        Commands::Rpc { command } => cli::handle_rpc_command(&plane, command).await,
        Commands::Watch => Ok(()),
    }
}

/// Foreground scheduler for hosts without cron. The config is reloaded
/// before every pass; the schedule itself is fixed at startup.
async fn watch(config_path: &Path) -> Result<()> {
    let initial = config::load(config_path)?;
    let expr = cron::resolve_schedule(&initial);
    let schedule = cron::parse_schedule(&expr)?;
    let lock = PassLock::new(initial.lock_path.clone());

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    info!(schedule = %expr, config = %config_path.display(), "watching");
    loop {
        let Some(next) = schedule.upcoming(chrono::Local).next() else {
            anyhow::bail!("schedule '{expr}' has no upcoming runs");
        };
        let wait = (next - chrono::Local::now()).to_std().unwrap_or_default();
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }

        let plane = match ControlPlane::open(config_path) {
            Ok(plane) => plane.with_lock(lock.clone()),
            Err(e) => {
                warn!("skipping pass: {e:#}");
                continue;
            }
        };
        // A pass in flight runs to completion; only run_timeout cancels it.
        let result = match plane.coordinator() {
            Ok(coordinator) => coordinator.run_scheduled().await,
            Err(e) => {
                warn!("skipping pass: {e:#}");
                continue;
            }
        };
        if result.ok {
            info!("pass ok");
        } else {
            warn!(error = result.error.as_deref().unwrap_or(""), "pass failed");
        }
        tracing::debug!("{}", result.output);

        if token.is_cancelled() {
            break;
        }
    }
    info!("watch stopped");
    Ok(())
}
