//! VPN connectivity watchdog.
//!
//! Probes a configured set of sites through the tunnel and rotates the
//! polling interface to another WireGuard peer when the path looks blocked.

pub mod error;
pub mod failover;
pub mod journal;
pub mod lock;
pub mod peers;
pub mod probe;
pub mod runner;
pub mod sites;
pub mod tunnel;

pub use error::WatchdogError;
pub use failover::{Decision, FailoverController, FailoverState};
pub use journal::WatchdogLog;
pub use lock::{PassGuard, PassLock};
pub use peers::{group_by_region, rotation_order, Peer, PeerRegistry, RegionGroup, Whitelist};
pub use probe::{
    aggregate, classify, probe_all, FailurePolicy, HttpProber, PathVerdict, ProbeOutcome,
    ProbeSettings, Prober, Verdict,
};
pub use runner::{RunCoordinator, RunResult, RunSettings};
pub use sites::{Site, SiteStore, DEFAULT_BLOCK_PATTERN};
pub use tunnel::{TunnelControl, UciTunnel};
