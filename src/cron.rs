//! Scheduled trigger: schedule resolution and crontab installation.
//!
//! The crontab keeps at most one watchdog line, tagged with [`CRON_MARKER`].
//! Everything else in the file is left untouched.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{WatchdogConfig, DEFAULT_CONFIG_PATH};
use crate::watchdog::WatchdogError;

/// Trailing tag identifying the watchdog's crontab line.
pub const CRON_MARKER: &str = "# vpn-watchdog";

const CRON_INIT_SCRIPT: &str = "/etc/init.d/cron";
const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Custom expression when set, else every `cron_interval` minutes.
pub fn resolve_schedule(config: &WatchdogConfig) -> String {
    match &config.cron_schedule {
        Some(expr) => expr.split_whitespace().collect::<Vec<_>>().join(" "),
        None => format!("*/{} * * * *", config.cron_interval.max(1)),
    }
}

/// Parse a 5-field crontab expression.
pub fn parse_schedule(expr: &str) -> Result<::cron::Schedule, WatchdogError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(WatchdogError::ConfigValidation(format!(
            "cron schedule '{expr}' must have 5 fields, got {}",
            fields.len()
        )));
    }
    let dow = crontab_weekdays(fields[4]).ok_or_else(|| {
        WatchdogError::ConfigValidation(format!("invalid day-of-week field '{}'", fields[4]))
    })?;
    // The cron crate wants seconds first and numbers weekdays from 1 = Sunday.
    let full = format!("0 {} {} {} {} {dow}", fields[0], fields[1], fields[2], fields[3]);
    ::cron::Schedule::from_str(&full).map_err(|e| {
        WatchdogError::ConfigValidation(format!("invalid cron schedule '{expr}': {e}"))
    })
}

/// Rewrite crontab day numbers (0-7, Sunday is 0 and 7) as names.
fn crontab_weekdays(field: &str) -> Option<String> {
    const NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];
    let name = |tok: &str| -> Option<String> {
        match tok.parse::<usize>() {
            Ok(n) => NAMES.get(n).map(|s| s.to_string()),
            Err(_) => Some(tok.to_string()),
        }
    };
    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (item, None),
        };
        let mut mapped = match range.split_once('-') {
            Some((a, b)) => format!("{}-{}", name(a)?, name(b)?),
            None => name(range)?,
        };
        if let Some(step) = step {
            mapped.push('/');
            mapped.push_str(step);
        }
        parts.push(mapped);
    }
    Some(parts.join(","))
}

/// The full crontab line for `schedule`.
pub fn crontab_line(schedule: &str, binary: &Path, config_path: &Path) -> String {
    let mut command = binary.display().to_string();
    if config_path != Path::new(DEFAULT_CONFIG_PATH) {
        command.push_str(&format!(" --config {}", config_path.display()));
    }
    format!("{schedule} {command} run --scheduled {CRON_MARKER}")
}

/// Drop every tagged line from `existing`, then append `line` if given.
pub fn rewrite_crontab(existing: &str, line: Option<&str>) -> String {
    let mut out: Vec<&str> = existing
        .lines()
        .filter(|l| !l.trim_end().ends_with(CRON_MARKER))
        .collect();
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    if let Some(line) = line {
        out.push(line);
    }
    if out.is_empty() {
        return String::new();
    }
    let mut content = out.join("\n");
    content.push('\n');
    content
}

/// Install or remove the scheduled trigger according to `config`.
///
/// Returns the installed schedule, or `None` when cron is disabled.
pub async fn apply_cron(
    config: &WatchdogConfig,
    binary: &Path,
    config_path: &Path,
) -> Result<Option<String>> {
    let installed = if config.cron_enabled {
        let schedule = resolve_schedule(config);
        parse_schedule(&schedule)?;
        Some(schedule)
    } else {
        None
    };

    let path = &config.crontab_path;
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let line = installed
        .as_deref()
        .map(|schedule| crontab_line(schedule, binary, config_path));
    let updated = rewrite_crontab(&existing, line.as_deref());

    if updated != existing {
        write_atomic(path, &updated).await?;
        tracing::info!(crontab = %path.display(), schedule = ?installed, "crontab updated");
        reload_cron_daemon().await;
    }
    Ok(installed)
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp: PathBuf = path.with_extension("vpn-watchdog.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Restart busybox crond so it rereads the crontab. Best effort.
async fn reload_cron_daemon() {
    let script = Path::new(CRON_INIT_SCRIPT);
    if !script.exists() {
        return;
    }
    let mut cmd = tokio::process::Command::new(script);
    cmd.arg("restart").kill_on_drop(true);
    match tokio::time::timeout(RELOAD_TIMEOUT, cmd.status()).await {
        Ok(Ok(status)) if status.success() => tracing::debug!("cron daemon restarted"),
        Ok(Ok(status)) => tracing::warn!("{CRON_INIT_SCRIPT} restart exited with {status}"),
        Ok(Err(e)) => tracing::warn!("failed to run {CRON_INIT_SCRIPT}: {e}"),
        Err(_) => tracing::warn!("{CRON_INIT_SCRIPT} restart timed out"),
    }
}
