//! Site probe engine.
//!
//! Issues bounded-time HTTP GETs through the egress interface and classifies
//! each response body against the site's block/success patterns. Probes for a
//! site set run concurrently; the path verdict is computed only once every
//! probe has finished.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use super::error::WatchdogError;
use super::sites::Site;

/// User agent sent with every probe. Some block pages differ for bots.
const PROBE_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) vpn-watchdog";

/// Verdict of a single site probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Reachable and the body passed pattern checks.
    Healthy,
    /// Reachable but the body looks blocked or lacks the success marker.
    Unhealthy,
    /// Transport failure: DNS, connect, TLS or timeout.
    Unreachable,
}

impl Verdict {
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Aggregate verdict for the egress path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathVerdict {
    Healthy,
    Failed,
}

impl fmt::Display for PathVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How many failed sites it takes to call the path failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Every site must fail.
    #[default]
    All,
    /// Strictly more than half of the sites must fail.
    Majority,
    /// A single failed site is enough.
    Any,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "unanimous" => Ok(Self::All),
            "majority" => Ok(Self::Majority),
            "any" => Ok(Self::Any),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Majority => write!(f, "majority"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Result of probing one site.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub site: String,
    pub verdict: Verdict,
    /// Why the probe failed, if it did.
    pub detail: Option<String>,
    /// Time to full body (present only when the site was reachable).
    pub latency_ms: Option<u64>,
}

impl ProbeOutcome {
    fn reachable(site: &Site, body: &str, latency: Duration) -> Self {
        let (verdict, detail) = match evaluate(
            body,
            site.block_pattern.as_ref(),
            site.success_pattern.as_ref(),
        ) {
            Ok(()) => (Verdict::Healthy, None),
            Err(reason) => {
                let err = WatchdogError::ProbeContentMismatch {
                    site: site.name.clone(),
                    reason,
                };
                (Verdict::Unhealthy, Some(err.to_string()))
            }
        };
        Self {
            site: site.name.clone(),
            verdict,
            detail,
            latency_ms: Some(latency.as_millis() as u64),
        }
    }

    /// Build a transport-failure outcome.
    pub fn unreachable(site: &Site, reason: impl Into<String>) -> Self {
        let err = WatchdogError::ProbeTransport {
            site: site.name.clone(),
            reason: reason.into(),
        };
        Self {
            site: site.name.clone(),
            verdict: Verdict::Unreachable,
            detail: Some(err.to_string()),
            latency_ms: None,
        }
    }
}

/// Classify a response body.
///
/// A block match wins over everything; then a configured success pattern
/// must match. With neither pattern set a reachable site is healthy.
pub fn classify(body: &str, block: Option<&Regex>, success: Option<&Regex>) -> Verdict {
    match evaluate(body, block, success) {
        Ok(()) => Verdict::Healthy,
        Err(_) => Verdict::Unhealthy,
    }
}

fn evaluate(
    body: &str,
    block: Option<&Regex>,
    success: Option<&Regex>,
) -> std::result::Result<(), String> {
    if let Some(re) = block {
        if let Some(m) = re.find(body) {
            return Err(format!("block pattern matched '{}'", m.as_str()));
        }
    }
    if let Some(re) = success {
        if !re.is_match(body) {
            return Err(format!("success pattern '{}' not found", re.as_str()));
        }
    }
    Ok(())
}

/// Reduce per-site verdicts to a path verdict.
///
/// An empty site set cannot prove anything and is treated as healthy.
pub fn aggregate(verdicts: &[Verdict], policy: FailurePolicy) -> PathVerdict {
    if verdicts.is_empty() {
        return PathVerdict::Healthy;
    }
    let failed = verdicts.iter().filter(|v| v.is_failure()).count();
    let is_failed = match policy {
        FailurePolicy::All => failed == verdicts.len(),
        FailurePolicy::Majority => failed * 2 > verdicts.len(),
        FailurePolicy::Any => failed > 0,
    };
    if is_failed {
        PathVerdict::Failed
    } else {
        PathVerdict::Healthy
    }
}

/// Prefix bare domains with `https://`.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Something that can probe a site.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, site: &Site) -> ProbeOutcome;
}

/// Probe every site concurrently and wait for all of them.
pub async fn probe_all(prober: &dyn Prober, sites: &[Site]) -> Vec<ProbeOutcome> {
    let futures: Vec<_> = sites.iter().map(|site| prober.probe(site)).collect();
    futures_util::future::join_all(futures).await
}

/// Timeouts and binding for [`HttpProber`].
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Bounds connection establishment.
    pub connect_timeout: Duration,
    /// Bounds the whole request including the body.
    pub max_time: Duration,
    /// Network device to bind probe sockets to.
    pub interface: Option<String>,
}

/// Probes sites over HTTP(S) with `reqwest`.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(settings: &ProbeSettings) -> Result<Self> {
        let builder = reqwest::Client::builder()
            .no_proxy()
            .user_agent(PROBE_USER_AGENT)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.max_time);
        let builder = bind_interface(builder, settings.interface.as_deref());
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build probe client: {e}"))?;
        Ok(Self { client })
    }
}

#[cfg(target_os = "linux")]
fn bind_interface(
    builder: reqwest::ClientBuilder,
    interface: Option<&str>,
) -> reqwest::ClientBuilder {
    match interface {
        Some(iface) if !iface.is_empty() => builder.interface(iface),
        _ => builder,
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_interface(
    builder: reqwest::ClientBuilder,
    interface: Option<&str>,
) -> reqwest::ClientBuilder {
    if let Some(iface) = interface.filter(|i| !i.is_empty()) {
        tracing::warn!(iface, "interface binding is only supported on Linux; using default route");
    }
    builder
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, site: &Site) -> ProbeOutcome {
        let url = normalize_url(&site.url);
        let start = Instant::now();
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("timed out: {url}")
                } else if e.is_connect() {
                    format!("connect failed: {url}: {e}")
                } else {
                    format!("request failed: {url}: {e}")
                };
                tracing::debug!(site = %site.name, %reason, "probe unreachable");
                return ProbeOutcome::unreachable(site, reason);
            }
        };
        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                return ProbeOutcome::unreachable(site, format!("failed to read body: {url}: {e}"));
            }
        };
        let outcome = ProbeOutcome::reachable(site, &body, start.elapsed());
        tracing::debug!(
            site = %site.name,
            status = status.as_u16(),
            verdict = %outcome.verdict,
            "probe finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re(p: &str) -> Regex {
        Regex::new(p).unwrap()
    }

    #[test]
    fn success_pattern_match_is_healthy() {
        assert_eq!(classify("OK", None, Some(&re("OK"))), Verdict::Healthy);
    }

    #[test]
    fn block_pattern_match_is_unhealthy() {
        assert_eq!(
            classify("you are blocked", Some(&re("blocked")), None),
            Verdict::Unhealthy
        );
    }

    #[test]
    fn block_wins_over_success() {
        let body = "OK but captcha";
        assert_eq!(
            classify(body, Some(&re("captcha")), Some(&re("OK"))),
            Verdict::Unhealthy
        );
    }

    #[test]
    fn missing_success_marker_is_unhealthy() {
        assert_eq!(
            classify("<html>hello</html>", Some(&re("blocked")), Some(&re("reddit"))),
            Verdict::Unhealthy
        );
    }

    #[test]
    fn no_patterns_is_healthy() {
        assert_eq!(classify("anything", None, None), Verdict::Healthy);
    }

    #[test]
    fn aggregate_all_requires_unanimous_failure() {
        use Verdict::*;
        assert_eq!(aggregate(&[Unhealthy, Unreachable], FailurePolicy::All), PathVerdict::Failed);
        assert_eq!(
            aggregate(&[Unhealthy, Healthy, Unreachable], FailurePolicy::All),
            PathVerdict::Healthy
        );
    }

    #[test]
    fn aggregate_majority_and_any() {
        use Verdict::*;
        let half = [Unhealthy, Healthy];
        assert_eq!(aggregate(&half, FailurePolicy::Majority), PathVerdict::Healthy);
        assert_eq!(aggregate(&half, FailurePolicy::Any), PathVerdict::Failed);
        let most = [Unhealthy, Unreachable, Healthy];
        assert_eq!(aggregate(&most, FailurePolicy::Majority), PathVerdict::Failed);
    }

    #[test]
    fn aggregate_empty_is_healthy() {
        assert_eq!(aggregate(&[], FailurePolicy::Any), PathVerdict::Healthy);
    }

    #[test]
    fn normalize_url_adds_scheme() {
        assert_eq!(normalize_url("reddit.com"), "https://reddit.com");
        assert_eq!(normalize_url(" http://a.test/x "), "http://a.test/x");
        assert_eq!(normalize_url("HTTPS://A.test"), "HTTPS://A.test");
    }

    #[test]
    fn failure_policy_parse_and_display() {
        assert_eq!("ALL".parse::<FailurePolicy>().unwrap(), FailurePolicy::All);
        assert_eq!("majority".parse::<FailurePolicy>().unwrap(), FailurePolicy::Majority);
        assert_eq!("any".parse::<FailurePolicy>().unwrap(), FailurePolicy::Any);
        assert!("most".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::Majority.to_string(), "majority");
    }

    #[test]
    fn verdict_display() {
        assert_eq!(Verdict::Healthy.to_string(), "healthy");
        assert_eq!(Verdict::Unhealthy.to_string(), "unhealthy");
        assert_eq!(Verdict::Unreachable.to_string(), "unreachable");
    }

    #[test]
    fn unreachable_outcome_carries_reason() {
        let site = Site::bare("a.test");
        let outcome = ProbeOutcome::unreachable(&site, "timed out");
        assert_eq!(outcome.verdict, Verdict::Unreachable);
        assert!(outcome.detail.unwrap().contains("timed out"));
        assert!(outcome.latency_ms.is_none());
    }
}
