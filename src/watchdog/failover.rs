//! Failover state machine for a single pass.
//!
//! ```text
//! Idle --failed--> SelectingPeer --candidate--> Switching --applied--> Verifying
//!   ^                  ^   |                                              |
//!   |                  |   +--none left--> Exhausted                      |
//!   +----healthy-------+------------------failed--------------------------+
//! ```
//!
//! The controller is pure: it never touches the tunnel. The run coordinator
//! feeds it path verdicts, applies the switches it asks for and reports
//! back with [`FailoverController::switch_applied`].

use super::peers::{rotation_order, Peer};
use super::probe::PathVerdict;

/// Where the controller is in the current pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverState {
    Idle,
    SelectingPeer,
    Switching(Peer),
    Verifying(Peer),
    Exhausted,
}

/// What the coordinator should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Path is healthy on the original peer; nothing to do.
    Stay,
    /// Apply this peer, wait, then re-probe.
    SwitchTo(Peer),
    /// The last switched-to peer verified healthy.
    Recovered(Peer),
    /// Every eligible peer was tried and the path is still failed.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FailoverController {
    order: Vec<Peer>,
    origin: Option<String>,
    current: Option<String>,
    tried: Vec<String>,
    state: FailoverState,
}

impl FailoverController {
    /// Start a pass over `eligible` peers with `active` as the current peer.
    pub fn new(eligible: &[Peer], active: Option<&str>) -> Self {
        Self {
            order: rotation_order(eligible),
            origin: active.map(str::to_string),
            current: active.map(str::to_string),
            tried: Vec::new(),
            state: FailoverState::Idle,
        }
    }

    pub fn state(&self) -> &FailoverState {
        &self.state
    }

    /// Candidates switched to so far, in order.
    pub fn tried(&self) -> &[String] {
        &self.tried
    }

    /// The peer the tunnel is on now, as far as this pass knows.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Feed the latest path verdict.
    pub fn on_path_verdict(&mut self, verdict: PathVerdict) -> Decision {
        match (&self.state, verdict) {
            (FailoverState::Exhausted, _) => Decision::Exhausted,
            (FailoverState::Idle | FailoverState::SelectingPeer, PathVerdict::Healthy) => {
                self.state = FailoverState::Idle;
                Decision::Stay
            }
            (FailoverState::Verifying(peer) | FailoverState::Switching(peer), PathVerdict::Healthy) => {
                let peer = peer.clone();
                self.state = FailoverState::Idle;
                Decision::Recovered(peer)
            }
            (_, PathVerdict::Failed) => self.select(),
        }
    }

    /// Record that the requested switch has been applied.
    pub fn switch_applied(&mut self) {
        if let FailoverState::Switching(peer) = &self.state {
            let peer = peer.clone();
            self.current = Some(peer.id.clone());
            self.state = FailoverState::Verifying(peer);
        }
    }

    /// First untried peer after the current one in rotation order, wrapping.
    pub fn next_candidate(&self) -> Option<&Peer> {
        if self.order.is_empty() {
            return None;
        }
        let start = self
            .current
            .as_deref()
            .and_then(|id| self.order.iter().position(|p| p.id == id))
            .map_or(0, |idx| idx + 1);
        (0..self.order.len())
            .map(|offset| &self.order[(start + offset) % self.order.len()])
            .find(|p| !self.is_excluded(&p.id))
    }

    fn is_excluded(&self, id: &str) -> bool {
        self.origin.as_deref() == Some(id)
            || self.current.as_deref() == Some(id)
            || self.tried.iter().any(|t| t == id)
    }

    fn select(&mut self) -> Decision {
        self.state = FailoverState::SelectingPeer;
        match self.next_candidate().cloned() {
            Some(peer) => {
                self.tried.push(peer.id.clone());
                self.state = FailoverState::Switching(peer.clone());
                Decision::SwitchTo(peer)
            }
            None => {
                self.state = FailoverState::Exhausted;
                Decision::Exhausted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, region: Option<&str>) -> Peer {
        Peer {
            id: id.into(),
            endpoint: format!("{id}:51820"),
            description: String::new(),
            region: region.map(str::to_string),
            public_key: None,
        }
    }

    fn switch_target(decision: Decision) -> String {
        match decision {
            Decision::SwitchTo(peer) => peer.id,
            other => panic!("expected SwitchTo, got {other:?}"),
        }
    }

    #[test]
    fn healthy_path_stays_idle() {
        let peers = vec![peer("p1", None), peer("p2", None)];
        let mut ctl = FailoverController::new(&peers, Some("p1"));
        assert_eq!(ctl.on_path_verdict(PathVerdict::Healthy), Decision::Stay);
        assert_eq!(ctl.state(), &FailoverState::Idle);
        assert!(ctl.tried().is_empty());
    }

    #[test]
    fn two_peer_scenario_switches_then_exhausts() {
        let peers = vec![peer("p1", Some("US")), peer("p2", Some("CA"))];
        let mut ctl = FailoverController::new(&peers, Some("p1"));

        assert_eq!(switch_target(ctl.on_path_verdict(PathVerdict::Failed)), "p2");
        assert!(matches!(ctl.state(), FailoverState::Switching(p) if p.id == "p2"));
        ctl.switch_applied();
        assert!(matches!(ctl.state(), FailoverState::Verifying(p) if p.id == "p2"));
        assert_eq!(ctl.current(), Some("p2"));

        assert_eq!(ctl.on_path_verdict(PathVerdict::Failed), Decision::Exhausted);
        assert_eq!(ctl.state(), &FailoverState::Exhausted);
        assert_eq!(ctl.tried(), &["p2".to_string()]);
    }

    #[test]
    fn verified_candidate_recovers() {
        let peers = vec![peer("a", None), peer("b", None), peer("c", None)];
        let mut ctl = FailoverController::new(&peers, Some("a"));
        assert_eq!(switch_target(ctl.on_path_verdict(PathVerdict::Failed)), "b");
        ctl.switch_applied();
        assert_eq!(
            ctl.on_path_verdict(PathVerdict::Healthy),
            Decision::Recovered(peer("b", None))
        );
        assert_eq!(ctl.state(), &FailoverState::Idle);
    }

    #[test]
    fn rotation_visits_every_other_peer_exactly_once() {
        let peers: Vec<Peer> = (0..6)
            .map(|i| peer(&format!("p{i}"), if i % 2 == 0 { Some("EU") } else { None }))
            .collect();
        for start in &peers {
            let mut ctl = FailoverController::new(&peers, Some(&start.id));
            let mut visited = Vec::new();
            loop {
                match ctl.on_path_verdict(PathVerdict::Failed) {
                    Decision::SwitchTo(p) => {
                        visited.push(p.id);
                        ctl.switch_applied();
                    }
                    Decision::Exhausted => break,
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(visited.len(), peers.len() - 1, "start {}", start.id);
            assert!(!visited.contains(&start.id));
            let mut dedup = visited.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(dedup.len(), visited.len());
        }
    }

    #[test]
    fn rotation_wraps_after_active_in_region_order() {
        // order: EU:e1, US:u1, US:u2, none:x
        let peers = vec![
            peer("x", None),
            peer("u2", Some("US")),
            peer("e1", Some("EU")),
            peer("u1", Some("US")),
        ];
        let mut ctl = FailoverController::new(&peers, Some("u2"));
        let mut seq = Vec::new();
        while let Decision::SwitchTo(p) = ctl.on_path_verdict(PathVerdict::Failed) {
            seq.push(p.id);
            ctl.switch_applied();
        }
        assert_eq!(seq, vec!["x", "e1", "u1"]);
    }

    #[test]
    fn selection_is_deterministic() {
        let peers = vec![peer("b", Some("DE")), peer("a", Some("DE")), peer("z", None)];
        let first = FailoverController::new(&peers, Some("z"))
            .next_candidate()
            .cloned();
        let second = FailoverController::new(&peers, Some("z"))
            .next_candidate()
            .cloned();
        assert_eq!(first, second);
        assert_eq!(first.unwrap().id, "a");
    }

    #[test]
    fn active_outside_eligible_set_starts_from_the_top() {
        let peers = vec![peer("b", None), peer("a", None)];
        let mut ctl = FailoverController::new(&peers, Some("not-whitelisted"));
        assert_eq!(switch_target(ctl.on_path_verdict(PathVerdict::Failed)), "a");
        ctl.switch_applied();
        assert_eq!(switch_target(ctl.on_path_verdict(PathVerdict::Failed)), "b");
        ctl.switch_applied();
        assert_eq!(ctl.on_path_verdict(PathVerdict::Failed), Decision::Exhausted);
    }

    #[test]
    fn only_active_peer_eligible_is_exhausted_immediately() {
        let peers = vec![peer("solo", None)];
        let mut ctl = FailoverController::new(&peers, Some("solo"));
        assert_eq!(ctl.on_path_verdict(PathVerdict::Failed), Decision::Exhausted);
    }

    #[test]
    fn healthy_verdict_while_selecting_stays() {
        let peers = vec![peer("a", None), peer("b", None)];
        let mut ctl = FailoverController::new(&peers, Some("a"));
        ctl.state = FailoverState::SelectingPeer;
        assert_eq!(ctl.on_path_verdict(PathVerdict::Healthy), Decision::Stay);
        assert_eq!(ctl.state(), &FailoverState::Idle);
        assert!(ctl.tried().is_empty());
    }

    #[test]
    fn unknown_active_peer_is_handled() {
        let peers = vec![peer("a", None)];
        let mut ctl = FailoverController::new(&peers, None);
        assert_eq!(switch_target(ctl.on_path_verdict(PathVerdict::Failed)), "a");
    }
}
