//! Control-plane operations consumed by the admin panel.
//!
//! Each operation is a method on [`ControlPlane`] returning a serializable
//! reply. [`ControlPlane::call`] dispatches by method name with JSON
//! arguments, which is how the rpcd exec protocol (`rpc list` / `rpc call`)
//! reaches them.

pub mod cli;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::config::{self, WatchdogConfig};
use crate::cron;
use crate::watchdog::{
    HttpProber, PassLock, Peer, PeerRegistry, Prober, RunCoordinator, RunResult, SiteStore,
    TunnelControl, UciTunnel, WatchdogError, WatchdogLog, Whitelist,
};

/// `{ok, error?}` acknowledgement for mutating operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

impl From<Result<()>> for Ack {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(format!("{e:#}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReply {
    pub script_path: String,
    pub log_path: String,
    pub log_tail_lines: usize,
    pub enabled: bool,
    pub cron_enabled: bool,
    pub schedule: String,
    pub sites_file: String,
    pub polling_iface: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogReply {
    pub path: String,
    pub lines: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SitesReply {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeersReply {
    pub peers: Vec<Peer>,
    pub whitelist: Whitelist,
}

/// Operations exposed over rpcd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetStatus,
    GetLog,
    GetSites,
    SetSites,
    GetPeers,
    SetPeerWhitelist,
    RunNow,
    ApplyCron,
}

impl Method {
    pub const ALL: [Method; 8] = [
        Method::GetStatus,
        Method::GetLog,
        Method::GetSites,
        Method::SetSites,
        Method::GetPeers,
        Method::SetPeerWhitelist,
        Method::RunNow,
        Method::ApplyCron,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::GetStatus => "get_status",
            Self::GetLog => "get_log",
            Self::GetSites => "get_sites",
            Self::SetSites => "set_sites",
            Self::GetPeers => "get_peers",
            Self::SetPeerWhitelist => "set_peer_whitelist",
            Self::RunNow => "run_now",
            Self::ApplyCron => "apply_cron",
        }
    }

    /// Argument template advertised by `rpc list`.
    fn signature(self) -> Value {
        match self {
            Self::GetLog => json!({ "lines": 200 }),
            Self::SetSites => json!({ "content": "str" }),
            Self::SetPeerWhitelist => json!({ "peers": [] }),
            Self::RunNow => json!({ "dry_run": false }),
            _ => json!({}),
        }
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown method '{s}'"))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Method name to argument template, for `rpc list`.
pub fn list_methods() -> Value {
    let map: serde_json::Map<String, Value> = Method::ALL
        .into_iter()
        .map(|m| (m.name().to_string(), m.signature()))
        .collect();
    Value::Object(map)
}

#[derive(Debug, Default, Deserialize)]
struct LogArgs {
    #[serde(default, deserialize_with = "lenient_usize")]
    lines: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SitesArgs {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct WhitelistArgs {
    #[serde(default)]
    peers: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RunArgs {
    #[serde(default, deserialize_with = "lenient_bool")]
    dry_run: bool,
}

/// Accepts `20` or `"20"`.
fn lenient_usize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<usize>, D::Error> {
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Accepts `true`, `1`, `"1"` or `"true"`.
fn lenient_bool<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_u64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "yes" | "on"),
        _ => false,
    })
}

fn parse_args<T: DeserializeOwned + Default>(args: Value) -> Result<T> {
    match args {
        Value::Null => Ok(T::default()),
        other => serde_json::from_value(other).context("invalid arguments"),
    }
}

/// The watchdog as seen by the panel: one config snapshot plus collaborators.
pub struct ControlPlane {
    config_path: PathBuf,
    config: WatchdogConfig,
    prober: Arc<dyn Prober>,
    tunnel: Option<Arc<dyn TunnelControl>>,
    lock: PassLock,
    binary: PathBuf,
}

impl ControlPlane {
    pub fn new(
        config_path: impl Into<PathBuf>,
        config: WatchdogConfig,
        prober: Arc<dyn Prober>,
        tunnel: Option<Arc<dyn TunnelControl>>,
    ) -> Self {
        let lock = PassLock::new(config.lock_path.clone());
        let binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("vpn-watchdog"));
        Self {
            config_path: config_path.into(),
            config,
            prober,
            tunnel,
            lock,
            binary,
        }
    }

    /// Load the config and wire the HTTP prober and UCI tunnel backend.
    ///
    /// A host without `uci` still serves everything except peer and run
    /// operations.
    pub fn open(config_path: &Path) -> Result<Self> {
        let config = config::load(config_path)?;
        let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(&config.probe_settings())?);
        let tunnel = match UciTunnel::new(config.vpn_iface.clone(), config.polling_iface.clone()) {
            Ok(tunnel) => Some(Arc::new(tunnel) as Arc<dyn TunnelControl>),
            Err(e) => {
                tracing::debug!("tunnel backend unavailable: {e:#}");
                None
            }
        };
        Ok(Self::new(config_path, config, prober, tunnel))
    }

    /// Share the pass lock with other control planes in this process.
    pub fn with_lock(mut self, lock: PassLock) -> Self {
        self.lock = lock;
        self
    }

    /// Binary path written into the crontab and reported as `script_path`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    fn tunnel(&self) -> Result<&Arc<dyn TunnelControl>> {
        self.tunnel
            .as_ref()
            .context("no tunnel backend available ('uci' not found)")
    }

    fn log(&self) -> WatchdogLog {
        WatchdogLog::new(&self.config.log_path, self.config.log_max_lines)
    }

    fn sites(&self) -> SiteStore {
        SiteStore::new(&self.config.sites_file)
    }

    pub fn coordinator(&self) -> Result<RunCoordinator> {
        Ok(RunCoordinator::new(
            &self.config,
            Arc::clone(&self.prober),
            Arc::clone(self.tunnel()?),
        )
        .with_lock(self.lock.clone()))
    }

    pub fn get_status(&self) -> StatusReply {
        StatusReply {
            script_path: self.binary.display().to_string(),
            log_path: self.config.log_path.display().to_string(),
            log_tail_lines: self.config.log_tail_lines,
            enabled: self.config.enabled,
            cron_enabled: self.config.cron_enabled,
            schedule: cron::resolve_schedule(&self.config),
            sites_file: self.config.sites_file.display().to_string(),
            polling_iface: self.config.polling_iface.clone(),
        }
    }

    /// Log tail; `lines` defaults to `log_tail_lines`.
    pub async fn get_log(&self, lines: Option<usize>) -> Result<LogReply> {
        let log = self.log();
        let count = lines.filter(|n| *n > 0).unwrap_or(self.config.log_tail_lines);
        Ok(LogReply {
            path: log.path().display().to_string(),
            lines: log.tail(count).await?,
        })
    }

    pub async fn get_sites(&self) -> Result<SitesReply> {
        let store = self.sites();
        Ok(SitesReply {
            path: store.path().display().to_string(),
            content: store.read_raw().await?,
        })
    }

    /// Replace the site list. Invalid content leaves the file untouched.
    pub async fn set_sites(&self, content: &str) -> Ack {
        self.sites().write(content).await.into()
    }

    pub async fn get_peers(&self) -> Result<PeersReply> {
        let peers = self.tunnel()?.list_peers().await?;
        Ok(PeersReply {
            peers,
            whitelist: self.config.peer_whitelist.clone(),
        })
    }

    /// Persist the allow-list. An empty list allows every peer.
    pub async fn set_peer_whitelist(&self, ids: &[String]) -> Ack {
        if let Some(bad) = ids.iter().find(|id| {
            let id = id.trim();
            id.is_empty() || id.contains(char::is_whitespace)
        }) {
            return Ack::failed(
                WatchdogError::ConfigValidation(format!("invalid peer id '{bad}'")).to_string(),
            );
        }
        let whitelist = Whitelist::new(ids);

        if let Some(tunnel) = &self.tunnel {
            match tunnel.list_peers().await {
                Ok(peers) => {
                    let registry = PeerRegistry::new(peers);
                    for id in registry.unknown_ids(&whitelist) {
                        tracing::warn!(peer = id, "whitelisting a peer that is not configured");
                    }
                }
                Err(e) => tracing::debug!("could not check whitelist against peers: {e:#}"),
            }
        }

        config::save_whitelist(&self.config_path, &whitelist).into()
    }

    pub async fn run_now(&self, dry_run: bool) -> RunResult {
        match self.coordinator() {
            Ok(coordinator) => coordinator.run(dry_run).await,
            Err(e) => RunResult {
                ok: false,
                output: String::new(),
                error: Some(format!("{e:#}")),
            },
        }
    }

    pub async fn apply_cron(&self) -> Ack {
        cron::apply_cron(&self.config, &self.binary, &self.config_path)
            .await
            .map(|_| ())
            .into()
    }

    /// Dispatch one rpcd call.
    pub async fn call(&self, method: Method, args: Value) -> Result<Value> {
        let reply = match method {
            Method::GetStatus => serde_json::to_value(self.get_status())?,
            Method::GetLog => {
                let args: LogArgs = parse_args(args)?;
                serde_json::to_value(self.get_log(args.lines).await?)?
            }
            Method::GetSites => serde_json::to_value(self.get_sites().await?)?,
            Method::SetSites => {
                let args: SitesArgs = parse_args(args)?;
                serde_json::to_value(self.set_sites(&args.content).await)?
            }
            Method::GetPeers => serde_json::to_value(self.get_peers().await?)?,
            Method::SetPeerWhitelist => {
                let args: WhitelistArgs = parse_args(args)?;
                let ids = args.peers.unwrap_or_default();
                serde_json::to_value(self.set_peer_whitelist(&ids).await)?
            }
            Method::RunNow => {
                let args: RunArgs = parse_args(args)?;
                serde_json::to_value(self.run_now(args.dry_run).await)?
            }
            Method::ApplyCron => serde_json::to_value(self.apply_cron().await)?,
        };
        Ok(reply)
    }
}

/// Error reply for a call that could not be dispatched.
pub fn error_reply(error: &anyhow::Error) -> Value {
    json!({ "ok": false, "error": format!("{error:#}") })
}
