//! Watchdog configuration file.
//!
//! A TOML file with a single `[watchdog]` table. Values written by the admin
//! panel are often strings (`"5"`, `"1"`), so every key is read leniently:
//! anything that does not make sense is logged and replaced by its default.

pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use toml::{Table, Value};

pub use schema::WatchdogConfig;

use crate::watchdog::Whitelist;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpn-watchdog/config.toml";

/// Environment variable that overrides the config path.
pub const CONFIG_ENV: &str = "VPN_WATCHDOG_CONFIG";

const SECTION: &str = "watchdog";

/// Pick the config path: explicit flag, then `VPN_WATCHDOG_CONFIG`, then the default.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return expand_path(&path.to_string_lossy());
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => expand_path(&path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

/// Load the config file. A missing file yields defaults.
pub fn load(path: &Path) -> Result<WatchdogConfig> {
    let table = match read_table(path)? {
        Some(table) => table,
        None => {
            tracing::debug!("config {} not found, using defaults", path.display());
            return Ok(WatchdogConfig::default());
        }
    };
    let section = match table.get(SECTION) {
        Some(Value::Table(section)) => section.clone(),
        Some(_) => {
            tracing::warn!("[{SECTION}] in {} is not a table, using defaults", path.display());
            Table::new()
        }
        None => Table::new(),
    };
    Ok(from_table(&section))
}

/// Build a config from a `[watchdog]` table.
pub fn from_table(t: &Table) -> WatchdogConfig {
    let d = WatchdogConfig::default();
    WatchdogConfig {
        enabled: read_bool(t, "enabled", d.enabled),
        log_path: read_path(t, "log_path").unwrap_or(d.log_path),
        cron_enabled: read_bool(t, "cron_enabled", d.cron_enabled),
        cron_interval: read_u64(t, &["cron_interval"], d.cron_interval.into(), 1, 59) as u32,
        cron_schedule: read_string(t, "cron_schedule"),
        crontab_path: read_path(t, "crontab_path").unwrap_or(d.crontab_path),
        sites_file: read_path(t, "sites_file").unwrap_or(d.sites_file),
        vpn_iface: read_string(t, "vpn_iface"),
        polling_iface: read_string(t, "polling_iface").unwrap_or(d.polling_iface),
        sleep_after_switch: read_secs(t, &["sleep_after_switch"], d.sleep_after_switch, 0),
        connect_timeout: read_secs(
            t,
            &["connect_timeout", "curl_connect_timeout"],
            d.connect_timeout,
            1,
        ),
        max_time: read_secs(t, &["max_time", "curl_max_time"], d.max_time, 1),
        run_timeout: read_secs(t, &["run_timeout"], d.run_timeout, 1),
        log_tail_lines: read_u64(t, &["log_tail_lines"], d.log_tail_lines as u64, 1, 100_000)
            as usize,
        log_max_lines: read_u64(t, &["log_max_lines"], d.log_max_lines as u64, 10, 1_000_000)
            as usize,
        lock_path: match t.get("lock_path") {
            None => d.lock_path,
            Some(_) => read_path(t, "lock_path"),
        },
        failure_policy: match read_string(t, "failure_policy") {
            None => d.failure_policy,
            Some(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!("{e}; using '{}'", d.failure_policy);
                d.failure_policy
            }),
        },
        peer_whitelist: read_whitelist(t),
    }
}

/// Replace `watchdog.peer_whitelist`, keeping every other key of the file.
pub fn save_whitelist(path: &Path, whitelist: &Whitelist) -> Result<()> {
    let mut table = read_table(path)?.unwrap_or_default();
    let section = table
        .entry(SECTION.to_string())
        .or_insert(Value::Table(Table::new()));
    let Value::Table(section) = section else {
        anyhow::bail!("[{SECTION}] in {} is not a table", path.display());
    };
    let ids = whitelist
        .ids()
        .iter()
        .map(|id| Value::String(id.clone()))
        .collect();
    section.insert("peer_whitelist".to_string(), Value::Array(ids));

    let rendered = toml::to_string_pretty(&table).context("failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, rendered.as_bytes())
        .with_context(|| format!("failed to write temporary config to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

fn read_table(path: &Path) -> Result<Option<Table>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let table: Table = toml::from_str(&content)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;
    Ok(Some(table))
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw.trim()).into_owned())
}

fn read_string(t: &Table, key: &str) -> Option<String> {
    match t.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        other => {
            tracing::warn!("config key '{key}' should be a string, got {}", other.type_str());
            None
        }
    }
}

fn read_path(t: &Table, key: &str) -> Option<PathBuf> {
    read_string(t, key).map(|s| expand_path(&s))
}

fn read_bool(t: &Table, key: &str, default: bool) -> bool {
    let parsed = match t.get(key) {
        None => return default,
        Some(Value::Boolean(b)) => Some(*b),
        Some(Value::Integer(i)) => match i {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        Some(_) => None,
    };
    parsed.unwrap_or_else(|| {
        tracing::warn!("config key '{key}' is not a boolean, using {default}");
        default
    })
}

/// First present key among `keys`, accepted when within `min..=max`.
fn read_u64(t: &Table, keys: &[&str], default: u64, min: u64, max: u64) -> u64 {
    let Some((key, value)) = keys.iter().find_map(|k| t.get(*k).map(|v| (*k, v))) else {
        return default;
    };
    let parsed = match value {
        Value::Integer(i) => u64::try_from(*i).ok(),
        Value::String(s) if s.trim().is_empty() => return default,
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if (min..=max).contains(&n) => n,
        _ => {
            tracing::warn!("config key '{key}' has invalid value {value}, using {default}");
            default
        }
    }
}

fn read_secs(t: &Table, keys: &[&str], default: Duration, min: u64) -> Duration {
    Duration::from_secs(read_u64(t, keys, default.as_secs(), min, 86_400))
}

fn read_whitelist(t: &Table) -> Whitelist {
    match t.get("peer_whitelist") {
        None => Whitelist::default(),
        Some(Value::Array(items)) => Whitelist::new(items.iter().filter_map(|v| match v {
            Value::String(s) => Some(s.as_str()),
            other => {
                tracing::warn!("ignoring non-string whitelist entry {other}");
                None
            }
        })),
        Some(Value::String(s)) => Whitelist::new(s.split_whitespace()),
        Some(other) => {
            tracing::warn!("peer_whitelist should be a list, got {}", other.type_str());
            Whitelist::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> WatchdogConfig {
        let table: Table = toml::from_str(src).unwrap();
        match table.get(SECTION) {
            Some(Value::Table(t)) => from_table(t),
            _ => from_table(&Table::new()),
        }
    }

    #[test]
    fn missing_section_gives_defaults() {
        assert_eq!(parse(""), WatchdogConfig::default());
    }

    #[test]
    fn reads_typed_and_string_values() {
        let cfg = parse(
            r#"
            [watchdog]
            enabled = "0"
            cron_enabled = true
            cron_interval = "10"
            sleep_after_switch = 5
            curl_connect_timeout = "4"
            max_time = 12
            run_timeout = "60"
            log_tail_lines = 50
            polling_iface = "wg_poll"
            vpn_iface = "  "
            failure_policy = "majority"
            peer_whitelist = ["p1", "p2", "p1"]
            "#,
        );
        assert!(!cfg.enabled);
        assert!(cfg.cron_enabled);
        assert_eq!(cfg.cron_interval, 10);
        assert_eq!(cfg.sleep_after_switch, Duration::from_secs(5));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(4));
        assert_eq!(cfg.max_time, Duration::from_secs(12));
        assert_eq!(cfg.run_timeout, Duration::from_secs(60));
        assert_eq!(cfg.log_tail_lines, 50);
        assert_eq!(cfg.polling_iface, "wg_poll");
        assert_eq!(cfg.vpn_iface, None);
        assert_eq!(cfg.failure_policy, crate::watchdog::FailurePolicy::Majority);
        assert_eq!(cfg.peer_whitelist.ids(), &["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let d = WatchdogConfig::default();
        let cfg = parse(
            r#"
            [watchdog]
            enabled = "maybe"
            cron_interval = "often"
            run_timeout = 0
            max_time = -3
            connect_timeout = 2.5
            log_tail_lines = ""
            failure_policy = "most"
            "#,
        );
        assert_eq!(cfg.enabled, d.enabled);
        assert_eq!(cfg.cron_interval, d.cron_interval);
        assert_eq!(cfg.run_timeout, d.run_timeout);
        assert_eq!(cfg.max_time, d.max_time);
        assert_eq!(cfg.connect_timeout, d.connect_timeout);
        assert_eq!(cfg.log_tail_lines, d.log_tail_lines);
        assert_eq!(cfg.failure_policy, d.failure_policy);
    }

    #[test]
    fn whitelist_accepts_space_separated_string() {
        let cfg = parse("[watchdog]\npeer_whitelist = \"a b  c\"\n");
        assert_eq!(cfg.peer_whitelist.ids().len(), 3);
    }

    #[test]
    fn empty_lock_path_disables_file_lock() {
        let cfg = parse("[watchdog]\nlock_path = \"\"\n");
        assert_eq!(cfg.lock_path, None);
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, WatchdogConfig::default());
    }

    #[test]
    fn load_rejects_broken_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[watchdog\nenabled = ").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn save_whitelist_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[watchdog]\nrun_timeout = 30\npolling_iface = \"wgp\"\npeer_whitelist = [\"old\"]\n",
        )
        .unwrap();

        save_whitelist(&path, &Whitelist::new(["p2", "p1"])).unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.run_timeout, Duration::from_secs(30));
        assert_eq!(cfg.polling_iface, "wgp");
        assert_eq!(cfg.peer_whitelist.ids(), &["p2".to_string(), "p1".to_string()]);

        save_whitelist(&path, &Whitelist::default()).unwrap();
        assert!(load(&path).unwrap().peer_whitelist.is_unrestricted());
    }

    #[test]
    fn save_whitelist_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("config.toml");
        save_whitelist(&path, &Whitelist::new(["x"])).unwrap();
        assert_eq!(load(&path).unwrap().peer_whitelist.ids(), &["x".to_string()]);
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = resolve_config_path(Some(Path::new("/tmp/custom.toml")));
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }
}
