//! Tunnel control: the one piece of mutable shared state.
//!
//! [`TunnelControl`] lists configured peers, reports which one is active and
//! applies a new one. [`UciTunnel`] implements it for OpenWrt WireGuard
//! interfaces through the `uci` and `ifup` binaries.
//!
//! # UCI layout
//! ```text
//! network.wgclient_poll=interface            # polling interface, proto wireguard
//! network.cfg0a1b2c=wireguard_wgclient_poll  # its single peer, rewritten on switch
//! network.us_nyc=wireguard_wgclient          # catalogue peers
//! network.us_nyc.endpoint_host='nyc.example.net'
//! network.us_nyc.endpoint_port='51820'
//! network.us_nyc.public_key='...'
//! network.us_nyc.description='New York'
//! network.us_nyc.region='US'
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::peers::Peer;

/// Bound for every `uci`/`ifup` invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

const SECTION_PREFIX: &str = "wireguard_";

/// Access to the live tunnel configuration.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// All configured peers.
    async fn list_peers(&self) -> Result<Vec<Peer>>;

    /// Id of the peer the egress path currently uses, if recognisable.
    async fn active_peer(&self) -> Result<Option<String>>;

    /// Make `peer` the egress peer. On error the previous peer stays.
    async fn apply_peer(&self, peer: &Peer) -> Result<()>;
}

/// One UCI section from `uci show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UciSection {
    pub name: String,
    pub kind: String,
    pub options: BTreeMap<String, String>,
}

impl UciSection {
    fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn endpoint(&self) -> Option<String> {
        let host = self.option("endpoint_host")?;
        Some(match self.option("endpoint_port") {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    fn to_peer(&self) -> Option<Peer> {
        Some(Peer {
            id: self.name.clone(),
            endpoint: self.endpoint()?,
            description: self.option("description").unwrap_or_default().to_string(),
            region: self.option("region").map(str::to_string),
            public_key: self.option("public_key").map(str::to_string),
        })
    }
}

/// Parse `uci show <config>` output into sections, in file order.
pub fn parse_uci_show(output: &str) -> Vec<UciSection> {
    let mut sections: Vec<UciSection> = Vec::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = unquote(value);
        let mut parts = key.splitn(3, '.');
        let (_config, section, option) = (parts.next(), parts.next(), parts.next());
        let Some(section) = section else {
            continue;
        };
        match option {
            None => sections.push(UciSection {
                name: section.to_string(),
                kind: value,
                options: BTreeMap::new(),
            }),
            Some(option) => {
                if let Some(target) = sections.iter_mut().rev().find(|s| s.name == section) {
                    target.options.insert(option.to_string(), value);
                }
            }
        }
    }
    sections
}

/// Strip UCI shell quoting: `'it'\''s'` -> `it's`.
fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(raw);
    inner.replace("'\\''", "'")
}

/// Catalogue peers: wireguard sections of `vpn_iface` (or of every interface
/// when unset), excluding the polling interface's own peer.
pub fn catalogue_peers(
    sections: &[UciSection],
    vpn_iface: Option<&str>,
    polling_iface: &str,
) -> Vec<Peer> {
    let polling_kind = format!("{SECTION_PREFIX}{polling_iface}");
    sections
        .iter()
        .filter(|s| s.kind.starts_with(SECTION_PREFIX) && s.kind != polling_kind)
        .filter(|s| match vpn_iface {
            Some(iface) => s.kind == format!("{SECTION_PREFIX}{iface}"),
            None => true,
        })
        .filter_map(UciSection::to_peer)
        .collect()
}

/// The polling interface's peer section.
pub fn polling_section<'a>(sections: &'a [UciSection], polling_iface: &str) -> Option<&'a UciSection> {
    let kind = format!("{SECTION_PREFIX}{polling_iface}");
    sections.iter().find(|s| s.kind == kind)
}

/// Which catalogue peer the polling section points at: public key first,
/// endpoint when keys are missing.
pub fn match_active(polling: &UciSection, catalogue: &[Peer]) -> Option<String> {
    if let Some(key) = polling.option("public_key") {
        if let Some(peer) = catalogue.iter().find(|p| p.public_key.as_deref() == Some(key)) {
            return Some(peer.id.clone());
        }
    }
    let endpoint = polling.endpoint()?;
    catalogue
        .iter()
        .find(|p| p.endpoint.eq_ignore_ascii_case(&endpoint))
        .map(|p| p.id.clone())
}

/// Split `host:port`, leaving IPv6 literals in brackets intact.
fn split_endpoint(endpoint: &str) -> (&str, Option<&str>) {
    match endpoint.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']')) =>
        {
            (host, Some(port))
        }
        _ => (endpoint, None),
    }
}

/// OpenWrt WireGuard backend driven by `uci`.
pub struct UciTunnel {
    uci_bin: PathBuf,
    ifup_bin: PathBuf,
    vpn_iface: Option<String>,
    polling_iface: String,
}

impl UciTunnel {
    /// Resolve the `uci` and `ifup` binaries.
    ///
    /// # Errors
    /// Returns error if `uci` is not installed.
    pub fn new(vpn_iface: Option<String>, polling_iface: String) -> Result<Self> {
        let uci_bin = which::which("uci")
            .context("'uci' binary not found in PATH; the UCI tunnel backend needs OpenWrt")?;
        let ifup_bin = which::which("ifup").unwrap_or_else(|_| PathBuf::from("/sbin/ifup"));
        Ok(Self::with_binaries(uci_bin, ifup_bin, vpn_iface, polling_iface))
    }

    /// Use explicit `uci` and `ifup` paths instead of searching PATH.
    pub fn with_binaries(
        uci_bin: PathBuf,
        ifup_bin: PathBuf,
        vpn_iface: Option<String>,
        polling_iface: String,
    ) -> Self {
        Self {
            uci_bin,
            ifup_bin,
            vpn_iface: vpn_iface.filter(|s| !s.trim().is_empty()),
            polling_iface,
        }
    }

    async fn run(&self, bin: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = tokio::process::Command::new(bin);
        cmd.args(args).kill_on_drop(true);
        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .with_context(|| {
                format!("{} {} timed out", bin.display(), args.join(" "))
            })?
            .with_context(|| format!("failed to spawn {}", bin.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} {} failed with {}: {}",
                bin.display(),
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn sections(&self) -> Result<Vec<UciSection>> {
        let out = self.run(&self.uci_bin, &["-X", "-q", "show", "network"]).await?;
        Ok(parse_uci_show(&out))
    }

    /// Stage option writes on `section`; `None` deletes the option.
    async fn stage(&self, section: &str, options: &[PeerOption]) -> Result<()> {
        for (key, value) in options {
            match value {
                Some(value) => {
                    let assignment = format!("network.{section}.{key}={value}");
                    self.run(&self.uci_bin, &["set", &assignment]).await?;
                }
                None => {
                    let option = format!("network.{section}.{key}");
                    self.run(&self.uci_bin, &["delete", &option]).await?;
                }
            }
        }
        Ok(())
    }

    /// Stage and commit `options`. Staged changes are reverted on failure.
    async fn write_peer(&self, section: &str, options: &[PeerOption]) -> Result<()> {
        let pending = PendingChanges::new(self.uci_bin.clone());
        let written = match self.stage(section, options).await {
            Ok(()) => self.run(&self.uci_bin, &["commit", "network"]).await.map(drop),
            Err(e) => Err(e),
        };
        pending.settle();
        if let Err(e) = written {
            if let Err(revert) = self.run(&self.uci_bin, &["revert", "network"]).await {
                tracing::warn!("failed to revert staged uci changes: {revert:#}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn ifup(&self) -> Result<()> {
        self.run(&self.ifup_bin, &[self.polling_iface.as_str()])
            .await
            .map(drop)
    }
}

/// An option write: key and new value, `None` to delete.
type PeerOption = (&'static str, Option<String>);

const PEER_OPTIONS: [&str; 3] = ["endpoint_host", "endpoint_port", "public_key"];

/// Options a switch to `peer` writes on the polling section.
fn peer_options(peer: &Peer) -> Vec<PeerOption> {
    let (host, port) = split_endpoint(&peer.endpoint);
    let mut options = vec![("endpoint_host", Some(host.to_string()))];
    if let Some(port) = port {
        options.push(("endpoint_port", Some(port.to_string())));
    }
    if let Some(key) = &peer.public_key {
        options.push(("public_key", Some(key.clone())));
    }
    options
}

/// Current values of the options in `target`, for rolling back.
fn previous_options(section: &UciSection, target: &[PeerOption]) -> Vec<PeerOption> {
    PEER_OPTIONS
        .iter()
        .filter(|key| target.iter().any(|(k, _)| k == *key))
        .map(|key| (*key, section.option(key).map(str::to_string)))
        .collect()
}

/// Reverts staged `uci` changes if dropped before [`PendingChanges::settle`],
/// which happens when a pass timeout cancels a switch midway.
struct PendingChanges {
    uci_bin: Option<PathBuf>,
}

impl PendingChanges {
    fn new(uci_bin: PathBuf) -> Self {
        Self {
            uci_bin: Some(uci_bin),
        }
    }

    fn settle(mut self) {
        self.uci_bin = None;
    }
}

impl Drop for PendingChanges {
    fn drop(&mut self) {
        let Some(bin) = self.uci_bin.take() else {
            return;
        };
        tracing::warn!("switch cancelled, reverting staged uci changes");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let status = tokio::process::Command::new(&bin)
                        .args(["revert", "network"])
                        .status()
                        .await;
                    if let Err(e) = status {
                        tracing::warn!("failed to revert staged uci changes: {e}");
                    }
                });
            }
            Err(_) => {
                let status = std::process::Command::new(&bin)
                    .args(["revert", "network"])
                    .status();
                if let Err(e) = status {
                    tracing::warn!("failed to revert staged uci changes: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl TunnelControl for UciTunnel {
    async fn list_peers(&self) -> Result<Vec<Peer>> {
        let sections = self.sections().await?;
        Ok(catalogue_peers(
            &sections,
            self.vpn_iface.as_deref(),
            &self.polling_iface,
        ))
    }

    async fn active_peer(&self) -> Result<Option<String>> {
        let sections = self.sections().await?;
        let catalogue = catalogue_peers(&sections, self.vpn_iface.as_deref(), &self.polling_iface);
        Ok(polling_section(&sections, &self.polling_iface).and_then(|s| match_active(s, &catalogue)))
    }

    async fn apply_peer(&self, peer: &Peer) -> Result<()> {
        let sections = self.sections().await?;
        let Some(section) = polling_section(&sections, &self.polling_iface) else {
            bail!(
                "polling interface '{}' has no wireguard peer section",
                self.polling_iface
            );
        };
        let target = peer_options(peer);
        let previous = previous_options(section, &target);

        self.write_peer(&section.name, &target).await?;

        if let Err(e) = self.ifup().await {
            tracing::warn!(peer = %peer.id, "ifup failed, restoring previous peer: {e:#}");
            let restored = match self.write_peer(&section.name, &previous).await {
                Ok(()) => self.ifup().await,
                Err(restore) => Err(restore),
            };
            return match restored {
                Ok(()) => Err(e.context("previous peer restored")),
                Err(restore) => Err(e.context(format!(
                    "restoring the previous peer also failed: {restore:#}"
                ))),
            };
        }
        tracing::info!(peer = %peer.id, endpoint = %peer.endpoint, iface = %self.polling_iface, "peer applied");
        Ok(())
    }
}
