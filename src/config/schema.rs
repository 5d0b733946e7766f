use std::path::PathBuf;
use std::time::Duration;

use crate::watchdog::{FailurePolicy, ProbeSettings, Whitelist};

pub const DEFAULT_LOG_PATH: &str = "/var/log/vpn-watchdog.log";
pub const DEFAULT_SITES_FILE: &str = "/etc/vpn-watchdog/sites.conf";
pub const DEFAULT_CRONTAB_PATH: &str = "/etc/crontabs/root";
pub const DEFAULT_LOCK_PATH: &str = "/var/run/vpn-watchdog.lock";
pub const DEFAULT_POLLING_IFACE: &str = "wgclient_poll";
pub const DEFAULT_CRON_INTERVAL: u32 = 5;
pub const DEFAULT_LOG_TAIL_LINES: usize = 200;
pub const DEFAULT_LOG_MAX_LINES: usize = 2000;

/// Effective watchdog settings. Read once per pass and never mutated during it.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Scheduled passes run and passes are logged only when set.
    pub enabled: bool,
    pub log_path: PathBuf,
    pub cron_enabled: bool,
    /// Minutes between scheduled passes.
    pub cron_interval: u32,
    /// Custom 5-field cron expression; overrides `cron_interval`.
    pub cron_schedule: Option<String>,
    pub crontab_path: PathBuf,
    pub sites_file: PathBuf,
    /// Catalogue interface; `None` means every WireGuard interface.
    pub vpn_iface: Option<String>,
    /// Interface whose peer is rotated and through which probes run.
    pub polling_iface: String,
    pub sleep_after_switch: Duration,
    pub connect_timeout: Duration,
    pub max_time: Duration,
    pub run_timeout: Duration,
    pub log_tail_lines: usize,
    pub log_max_lines: usize,
    /// `None` disables the cross-process lock.
    pub lock_path: Option<PathBuf>,
    pub failure_policy: FailurePolicy,
    pub peer_whitelist: Whitelist,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            cron_enabled: false,
            cron_interval: DEFAULT_CRON_INTERVAL,
            cron_schedule: None,
            crontab_path: PathBuf::from(DEFAULT_CRONTAB_PATH),
            sites_file: PathBuf::from(DEFAULT_SITES_FILE),
            vpn_iface: None,
            polling_iface: DEFAULT_POLLING_IFACE.to_string(),
            sleep_after_switch: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
            max_time: Duration::from_secs(8),
            run_timeout: Duration::from_secs(120),
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            lock_path: Some(PathBuf::from(DEFAULT_LOCK_PATH)),
            failure_policy: FailurePolicy::All,
            peer_whitelist: Whitelist::default(),
        }
    }
}

impl WatchdogConfig {
    /// Probe timeouts, bound to the polling interface.
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            connect_timeout: self.connect_timeout,
            max_time: self.max_time,
            interface: Some(self.polling_iface.clone()).filter(|i| !i.is_empty()),
        }
    }
}
