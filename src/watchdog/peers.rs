//! Peer registry: tunnel peers, whitelist filtering and region grouping.
//!
//! The registry is rebuilt from the live tunnel configuration at the start of
//! every pass and never cached beyond it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A configured tunnel peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable, unique identifier (the tunnel config section name).
    pub id: String,
    /// `host:port` of the remote end.
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Remote public key, used to recognise the active peer.
    #[serde(skip)]
    pub public_key: Option<String>,
}

impl Peer {
    /// Region bucket key; `None` is the "no region" bucket.
    pub fn region_key(&self) -> Option<&str> {
        self.region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

/// Allow-list of peer ids. Empty means every peer is eligible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Whitelist(Vec<String>);

impl Whitelist {
    /// Build from ids, trimming blanks and dropping duplicates (first wins).
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for id in ids {
            let id = id.as_ref().trim();
            if !id.is_empty() && !out.iter().any(|existing| existing == id) {
                out.push(id.to_string());
            }
        }
        Self(out)
    }

    /// Whether the whitelist allows everything.
    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }

    pub fn allows(&self, id: &str) -> bool {
        self.is_unrestricted() || self.0.iter().any(|w| w == id)
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }
}

/// Peers sharing a region, in rotation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionGroup {
    /// `None` for peers without a region.
    pub region: Option<String>,
    pub peers: Vec<Peer>,
}

/// Bucket peers by region. Named regions come first in lexicographic order,
/// the "no region" bucket is last, and peers are ordered by id inside a
/// bucket.
pub fn group_by_region(peers: &[Peer]) -> Vec<RegionGroup> {
    let mut named: BTreeMap<String, Vec<Peer>> = BTreeMap::new();
    let mut unnamed: Vec<Peer> = Vec::new();
    for peer in peers {
        match peer.region_key() {
            Some(region) => named.entry(region.to_string()).or_default().push(peer.clone()),
            None => unnamed.push(peer.clone()),
        }
    }

    let mut groups: Vec<RegionGroup> = named
        .into_iter()
        .map(|(region, peers)| RegionGroup {
            region: Some(region),
            peers,
        })
        .collect();
    if !unnamed.is_empty() {
        groups.push(RegionGroup {
            region: None,
            peers: unnamed,
        });
    }
    for group in &mut groups {
        group.peers.sort_by(|a, b| a.id.cmp(&b.id));
    }
    groups
}

/// Total order used for failover rotation: region buckets, then id.
pub fn rotation_order(peers: &[Peer]) -> Vec<Peer> {
    group_by_region(peers)
        .into_iter()
        .flat_map(|group| group.peers)
        .collect()
}

/// Snapshot of the configured peers for one pass.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self { peers }
    }

    /// All configured peers.
    pub fn list(&self) -> &[Peer] {
        &self.peers
    }

    /// Peers usable for failover under `whitelist`.
    pub fn eligible(&self, whitelist: &Whitelist) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|p| whitelist.allows(&p.id))
            .cloned()
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Whitelisted ids that no configured peer carries.
    pub fn unknown_ids<'a>(&self, whitelist: &'a Whitelist) -> Vec<&'a str> {
        whitelist
            .ids()
            .iter()
            .map(String::as_str)
            .filter(|id| self.find(id).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, region: Option<&str>) -> Peer {
        Peer {
            id: id.into(),
            endpoint: format!("{id}.example.net:51820"),
            description: String::new(),
            region: region.map(str::to_string),
            public_key: None,
        }
    }

    fn sample() -> Vec<Peer> {
        vec![
            peer("us2", Some("US")),
            peer("loose", None),
            peer("ca1", Some("CA")),
            peer("us1", Some("US")),
            peer("blank", Some("  ")),
        ]
    }

    #[test]
    fn empty_whitelist_means_all() {
        let registry = PeerRegistry::new(sample());
        let eligible = registry.eligible(&Whitelist::default());
        assert_eq!(eligible, registry.list().to_vec());
    }

    #[test]
    fn whitelist_is_an_intersection() {
        let registry = PeerRegistry::new(sample());
        let wl = Whitelist::new(["us1", "ca1", "gone"]);
        let ids: Vec<_> = registry
            .eligible(&wl)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["ca1", "us1"]);
        assert_eq!(registry.unknown_ids(&wl), vec!["gone"]);
    }

    #[test]
    fn whitelist_dedups_and_trims() {
        let wl = Whitelist::new([" a ", "b", "a", ""]);
        assert_eq!(wl.ids(), &["a".to_string(), "b".to_string()]);
        assert!(!wl.is_unrestricted());
        assert!(wl.allows("a"));
        assert!(!wl.allows("c"));
    }

    #[test]
    fn groups_are_sorted_with_no_region_last() {
        let groups = group_by_region(&sample());
        let regions: Vec<_> = groups.iter().map(|g| g.region.clone()).collect();
        assert_eq!(
            regions,
            vec![Some("CA".to_string()), Some("US".to_string()), None]
        );
        let us: Vec<_> = groups[1].peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(us, vec!["us1", "us2"]);
        let none: Vec<_> = groups[2].peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(none, vec!["blank", "loose"]);
    }

    #[test]
    fn rotation_order_flattens_groups() {
        let ids: Vec<_> = rotation_order(&sample()).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["ca1", "us1", "us2", "blank", "loose"]);
    }

    #[test]
    fn rotation_order_ignores_input_order() {
        let mut reversed = sample();
        reversed.reverse();
        assert_eq!(rotation_order(&reversed), rotation_order(&sample()));
    }

    #[test]
    fn whitelist_serializes_as_plain_list() {
        let wl = Whitelist::new(["p1", "p2"]);
        assert_eq!(serde_json::to_string(&wl).unwrap(), r#"["p1","p2"]"#);
    }
}
