/// PeerDirectory: name → peer handle map fed by announcements.
///
/// Pure state: no I/O, timestamps passed in (`*_at`) or taken from the wall
/// clock. One entry per name; the latest announcement wins.
use std::collections::HashMap;

use crate::types::{now_ms, PeerRef};

/// A discovered remote instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub name: String,
    /// Where to open a connection to reach the peer.
    pub reference: PeerRef,
    /// Last announcement (Unix ms).
    pub last_seen: u64,
}

/// What an announcement did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Our own announcement looped back; discarded.
    SelfEcho,
    /// First announcement for this name.
    Discovered,
    /// Known name; entry overwritten.
    Refreshed,
    /// Unusable announcement (empty name); discarded.
    Ignored,
}

pub struct PeerDirectory {
    local_name: String,
    peers: HashMap<String, PeerHandle>,
}

impl PeerDirectory {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            peers: HashMap::new(),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Record an announcement now.
    pub fn observe(&mut self, name: &str, reference: PeerRef) -> AnnounceOutcome {
        self.observe_at(name, reference, now_ms())
    }

    /// Record an announcement with a specific timestamp (for testing).
    pub fn observe_at(&mut self, name: &str, reference: PeerRef, timestamp: u64) -> AnnounceOutcome {
        if name.is_empty() {
            return AnnounceOutcome::Ignored;
        }
        if name == self.local_name {
            return AnnounceOutcome::SelfEcho;
        }

        let handle = PeerHandle {
            name: name.to_string(),
            reference,
            last_seen: timestamp,
        };
        match self.peers.insert(name.to_string(), handle) {
            Some(_) => AnnounceOutcome::Refreshed,
            None => AnnounceOutcome::Discovered,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PeerHandle> {
        self.peers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    /// Known peer names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop entries last seen before `cutoff` (Unix ms). Returns the dropped
    /// names, sorted.
    pub fn prune_older_than(&mut self, cutoff: u64) -> Vec<String> {
        let mut expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.name.clone())
            .collect();
        expired.sort();
        for name in &expired {
            self.peers.remove(name);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    fn peer_ref(port: u16) -> PeerRef {
        PeerRef::new(
            Identity::new("peer").unwrap(),
            ([10, 0, 0, 2], port).into(),
        )
    }

    #[test]
    fn first_announcement_discovers() {
        let mut dir = PeerDirectory::new("alice");
        assert_eq!(dir.observe_at("bob", peer_ref(4061), 1000), AnnounceOutcome::Discovered);
        assert_eq!(dir.get("bob").unwrap().last_seen, 1000);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn later_announcement_replaces() {
        let mut dir = PeerDirectory::new("alice");
        dir.observe_at("bob", peer_ref(4061), 1000);
        assert_eq!(dir.observe_at("bob", peer_ref(5000), 3000), AnnounceOutcome::Refreshed);

        let bob = dir.get("bob").unwrap();
        assert_eq!(bob.reference.addr.port(), 5000);
        assert_eq!(bob.last_seen, 3000);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn self_echo_suppressed() {
        let mut dir = PeerDirectory::new("alice");
        assert_eq!(dir.observe_at("alice", peer_ref(4061), 1000), AnnounceOutcome::SelfEcho);
        assert!(dir.is_empty());
    }

    #[test]
    fn empty_name_ignored() {
        let mut dir = PeerDirectory::new("alice");
        assert_eq!(dir.observe_at("", peer_ref(4061), 1000), AnnounceOutcome::Ignored);
        assert!(dir.is_empty());
    }

    #[test]
    fn names_sorted() {
        let mut dir = PeerDirectory::new("alice");
        dir.observe_at("dave", peer_ref(1), 0);
        dir.observe_at("bob", peer_ref(2), 0);
        dir.observe_at("carol", peer_ref(3), 0);
        assert_eq!(dir.names(), vec!["bob", "carol", "dave"]);
    }

    #[test]
    fn prune_removes_only_stale() {
        let mut dir = PeerDirectory::new("alice");
        dir.observe_at("bob", peer_ref(1), 1_000);
        dir.observe_at("carol", peer_ref(2), 9_000);
        dir.observe_at("dave", peer_ref(3), 2_000);

        let expired = dir.prune_older_than(5_000);
        assert_eq!(expired, vec!["bob", "dave"]);
        assert_eq!(dir.names(), vec!["carol"]);

        // Nothing left to prune at the same cutoff.
        assert!(dir.prune_older_than(5_000).is_empty());
    }
}
