#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;

use clap::Subcommand;

pub mod config;
pub mod cron;
pub mod rpc;
pub mod watchdog;

pub use config::WatchdogConfig;
pub use rpc::ControlPlane;

/// Top-level CLI commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run one watchdog pass
    Run {
        /// Compute and print decisions without switching peers
        #[arg(long)]
        dry_run: bool,
        /// Invoked by cron: skipped when the watchdog is disabled
        #[arg(long, conflicts_with = "dry_run")]
        scheduled: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration summary
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the tail of the watchdog log
    Log {
        /// Number of lines (defaults to log_tail_lines)
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    /// List peers or edit the failover whitelist
    Peers {
        #[command(subcommand)]
        command: Option<PeerCommands>,
    },
    /// Show or replace the probe site list
    Sites {
        #[command(subcommand)]
        command: SiteCommands,
    },
    /// Install or remove the crontab entry per the current config
    ApplyCron,
    /// Run passes on the configured schedule in the foreground
    Watch,
    /// rpcd exec interface used by the admin panel
    Rpc {
        #[command(subcommand)]
        command: RpcCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PeerCommands {
    /// List peers grouped by region
    List,
    /// Restrict failover to these peer ids
    Allow {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Allow failover to every peer
    AllowAll,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SiteCommands {
    /// Print the raw site list
    Show,
    /// Replace the site list from a file (`-` for stdin)
    Set { file: PathBuf },
    /// Append plain domains with the default block pattern
    Add {
        #[arg(required = true)]
        domains: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RpcCommands {
    /// Print the method signature map
    List,
    /// Call a method with JSON arguments on stdin
    Call { method: String },
}
