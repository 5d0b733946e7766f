//! Error taxonomy for a watchdog pass.
//!
//! Per-site transport and content failures are aggregated into verdicts and
//! never abort a pass. Everything else here is fatal to the current pass and
//! is surfaced to the caller as `{ok: false, error}`.

use std::time::Duration;

/// Errors raised while probing, deciding or switching.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    /// DNS, connect, TLS or timeout failure while probing a site.
    #[error("probe transport error for {site}: {reason}")]
    ProbeTransport { site: String, reason: String },

    /// The response body did not satisfy the site's patterns.
    #[error("probe content mismatch for {site}: {reason}")]
    ProbeContentMismatch { site: String, reason: String },

    /// Reconfiguring the tunnel failed; the previous peer stays in place.
    #[error("failed to switch to peer '{peer}': {reason}")]
    SwitchApply { peer: String, reason: String },

    /// Registry and whitelist leave nothing to fail over to.
    #[error("no eligible peer: {0}")]
    NoEligiblePeer(String),

    /// Every eligible peer was tried this pass and the path is still failed.
    #[error("all eligible peers exhausted (tried: {})", tried.join(", "))]
    Exhausted { tried: Vec<String> },

    /// The pass exceeded `run_timeout`.
    #[error("pass timed out after {}s", .0.as_secs())]
    PassTimeout(Duration),

    /// Another pass holds the pass lock.
    #[error("another watchdog pass is already running")]
    PassInProgress,

    /// Malformed site list or whitelist rejected before persisting.
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),
}

impl WatchdogError {
    /// Whether this error ends the pass.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ProbeTransport { .. } | Self::ProbeContentMismatch { .. }
        )
    }
}
