//! Run coordinator: one watchdog pass.
//!
//! A pass snapshots the site list, peer catalogue, active peer and whitelist,
//! probes the path and drives the [`FailoverController`] until the path is
//! healthy again or no candidate is left. Dry runs compute the same first
//! decision but never touch the tunnel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::config::WatchdogConfig;

use super::error::WatchdogError;
use super::failover::{Decision, FailoverController};
use super::journal::WatchdogLog;
use super::lock::PassLock;
use super::peers::{Peer, PeerRegistry, Whitelist};
use super::probe::{aggregate, probe_all, FailurePolicy, PathVerdict, ProbeOutcome, Prober};
use super::sites::{Site, SiteStore};
use super::tunnel::TunnelControl;

/// Summary of one pass, as returned to the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub ok: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pass-level knobs taken from the config snapshot.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub enabled: bool,
    pub whitelist: Whitelist,
    pub failure_policy: FailurePolicy,
    pub sleep_after_switch: Duration,
    pub run_timeout: Duration,
}

impl RunSettings {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            enabled: config.enabled,
            whitelist: config.peer_whitelist.clone(),
            failure_policy: config.failure_policy,
            sleep_after_switch: config.sleep_after_switch,
            run_timeout: config.run_timeout,
        }
    }
}

/// Mutable record of the pass in flight. Survives a timeout so the partial
/// narration can still be reported.
#[derive(Debug, Default)]
struct Pass {
    dry_run: bool,
    lines: Vec<String>,
    verdict: Option<PathVerdict>,
    action: &'static str,
    peer: Option<String>,
}

impl Pass {
    fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            action: "none",
            ..Self::default()
        }
    }

    fn say(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// One watchdog log line, without the timestamp.
    fn summary(&self, error: Option<&str>) -> String {
        let mut line = format!(
            "{}verdict={} action={} peer={}",
            if self.dry_run { "dry-run " } else { "" },
            self.verdict.map_or_else(|| "unknown".to_string(), |v| v.to_string()),
            self.action,
            self.peer.as_deref().unwrap_or("-"),
        );
        if let Some(err) = error {
            line.push_str(&format!(" error=\"{}\"", err.replace('"', "'")));
        }
        line
    }
}

pub struct RunCoordinator {
    prober: Arc<dyn Prober>,
    tunnel: Arc<dyn TunnelControl>,
    sites: SiteStore,
    log: WatchdogLog,
    lock: PassLock,
    settings: RunSettings,
}

impl RunCoordinator {
    pub fn new(
        config: &WatchdogConfig,
        prober: Arc<dyn Prober>,
        tunnel: Arc<dyn TunnelControl>,
    ) -> Self {
        Self {
            prober,
            tunnel,
            sites: SiteStore::new(&config.sites_file),
            log: WatchdogLog::new(&config.log_path, config.log_max_lines),
            lock: PassLock::new(config.lock_path.clone()),
            settings: RunSettings::from_config(config),
        }
    }

    /// Share a pass lock with other coordinators in this process.
    pub fn with_lock(mut self, lock: PassLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Pass triggered by the scheduler. Does nothing while disabled.
    pub async fn run_scheduled(&self) -> RunResult {
        if !self.settings.enabled {
            tracing::info!("watchdog disabled, skipping scheduled pass");
            return RunResult {
                ok: true,
                output: "watchdog disabled".to_string(),
                error: None,
            };
        }
        self.run(false).await
    }

    /// Run one pass, bounded by `run_timeout`.
    ///
    /// A second pass while one holds the lock is rejected, never queued.
    /// On timeout any switch already applied stays in effect.
    pub async fn run(&self, dry_run: bool) -> RunResult {
        let mut pass = Pass::new(dry_run);

        let _guard = match self.lock.try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("pass rejected: {e}");
                pass.action = "rejected";
                return self.finish(pass, Some(e.to_string())).await;
            }
        };

        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(self.settings.run_timeout, self.execute(&mut pass)).await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => {
                pass.action = "aborted";
                Some(WatchdogError::PassTimeout(self.settings.run_timeout).to_string())
            }
        };
        tracing::info!(
            dry_run,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = error.is_none(),
            action = pass.action,
            "watchdog pass finished"
        );
        self.finish(pass, error).await
    }

    async fn finish(&self, mut pass: Pass, error: Option<String>) -> RunResult {
        if let Some(err) = &error {
            pass.say(format!("error: {err}"));
        }
        if self.settings.enabled {
            let line = pass.summary(error.as_deref());
            // A rejected pass runs outside the lock; only the holder rotates.
            let written = if pass.action == "rejected" {
                self.log.append_unrotated(&line).await
            } else {
                self.log.append(&line).await
            };
            if let Err(e) = written {
                tracing::warn!("failed to append to {}: {e:#}", self.log.path().display());
            }
        }
        RunResult {
            ok: error.is_none(),
            output: pass.lines.join("\n"),
            error,
        }
    }

    async fn execute(&self, pass: &mut Pass) -> Result<()> {
        let sites = self.sites.load().await?;
        let registry = PeerRegistry::new(self.tunnel.list_peers().await?);
        let active = self.tunnel.active_peer().await?;
        pass.peer = active.clone();

        for id in registry.unknown_ids(&self.settings.whitelist) {
            tracing::warn!(peer = id, "whitelisted peer is not configured on the tunnel");
        }

        if pass.dry_run {
            pass.say("dry run: tunnel will not be modified");
        }
        pass.say(format!(
            "probing {} site(s) via peer {}",
            sites.len(),
            active.as_deref().unwrap_or("-")
        ));
        let mut verdict = self.probe_path(&sites, pass).await;

        if verdict == PathVerdict::Healthy {
            pass.action = "stay";
            pass.say("path healthy, no switch needed");
            return Ok(());
        }

        let eligible = registry.eligible(&self.settings.whitelist);
        if eligible.is_empty() {
            let reason = if registry.list().is_empty() {
                "no peers configured on the tunnel".to_string()
            } else {
                format!(
                    "whitelist [{}] matches none of {} configured peer(s)",
                    self.settings.whitelist.ids().join(", "),
                    registry.list().len()
                )
            };
            return Err(WatchdogError::NoEligiblePeer(reason).into());
        }

        let mut controller = FailoverController::new(&eligible, active.as_deref());
        loop {
            match controller.on_path_verdict(verdict) {
                Decision::Stay => {
                    pass.action = "stay";
                    return Ok(());
                }
                Decision::Recovered(peer) => {
                    pass.action = "switch";
                    pass.say(format!("path healthy on peer {}", peer.id));
                    return Ok(());
                }
                Decision::Exhausted => {
                    pass.action = "exhausted";
                    return Err(WatchdogError::Exhausted {
                        tried: controller.tried().to_vec(),
                    }
                    .into());
                }
                Decision::SwitchTo(peer) => {
                    if pass.dry_run {
                        pass.action = "would-switch";
                        pass.say(format!("would switch to peer {}", describe(&peer)));
                        return Ok(());
                    }
                    pass.say(format!("switching to peer {}", describe(&peer)));
                    self.tunnel.apply_peer(&peer).await.map_err(|e| {
                        WatchdogError::SwitchApply {
                            peer: peer.id.clone(),
                            reason: format!("{e:#}"),
                        }
                    })?;
                    controller.switch_applied();
                    pass.action = "switch";
                    pass.peer = Some(peer.id.clone());
                    tracing::info!(peer = %peer.id, endpoint = %peer.endpoint, "tunnel peer switched");

                    if !self.settings.sleep_after_switch.is_zero() {
                        tokio::time::sleep(self.settings.sleep_after_switch).await;
                    }
                    verdict = self.probe_path(&sites, pass).await;
                }
            }
        }
    }

    /// Probe every site, narrate per-site results and aggregate.
    async fn probe_path(&self, sites: &[Site], pass: &mut Pass) -> PathVerdict {
        let outcomes = probe_all(self.prober.as_ref(), sites).await;
        for outcome in &outcomes {
            pass.say(narrate(outcome));
        }
        let verdicts: Vec<_> = outcomes.iter().map(|o| o.verdict).collect();
        let verdict = aggregate(&verdicts, self.settings.failure_policy);
        pass.verdict = Some(verdict);
        pass.say(format!(
            "path verdict: {verdict} (policy {})",
            self.settings.failure_policy
        ));
        verdict
    }
}

fn narrate(outcome: &ProbeOutcome) -> String {
    let mut line = format!("  {}: {}", outcome.site, outcome.verdict);
    if let Some(ms) = outcome.latency_ms {
        line.push_str(&format!(" ({ms} ms)"));
    }
    if let Some(detail) = &outcome.detail {
        line.push_str(&format!(" - {detail}"));
    }
    line
}

fn describe(peer: &Peer) -> String {
    match peer.region_key() {
        Some(region) => format!("{} [{region}] {}", peer.id, peer.endpoint),
        None => format!("{} {}", peer.id, peer.endpoint),
    }
}
