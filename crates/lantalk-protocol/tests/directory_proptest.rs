use std::collections::HashMap;

use lantalk_protocol::{AnnounceOutcome, Identity, PeerDirectory, PeerRef};
use proptest::prelude::*;

const LOCAL: &str = "alice";

fn peer_ref(port: u16) -> PeerRef {
    PeerRef::new(Identity::from_static("peer"), ([10, 0, 0, 9], port).into())
}

/// Names drawn from a small pool so collisions (and self echoes) are common.
fn arb_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(LOCAL.to_string()),
        Just(String::new()),
        "[a-e]{1,2}",
    ]
}

proptest! {
    /// One entry per name, holding the latest announcement for it.
    #[test]
    fn latest_announcement_wins(
        announcements in prop::collection::vec((arb_name(), 1024..65535u16), 0..64),
    ) {
        let mut dir = PeerDirectory::new(LOCAL);
        let mut expected: HashMap<String, u16> = HashMap::new();

        for (i, (name, port)) in announcements.iter().enumerate() {
            let outcome = dir.observe_at(name, peer_ref(*port), i as u64);
            if name.is_empty() || name == LOCAL {
                continue;
            }
            let first = expected.insert(name.clone(), *port).is_none();
            prop_assert_eq!(
                outcome,
                if first { AnnounceOutcome::Discovered } else { AnnounceOutcome::Refreshed }
            );
        }

        prop_assert_eq!(dir.len(), expected.len());
        for (name, port) in &expected {
            prop_assert_eq!(dir.get(name).unwrap().reference.addr.port(), *port);
        }
    }

    /// Our own name and empty names never enter the directory.
    #[test]
    fn self_and_empty_never_inserted(
        ports in prop::collection::vec(1024..65535u16, 1..16),
    ) {
        let mut dir = PeerDirectory::new(LOCAL);
        for port in ports {
            prop_assert_eq!(dir.observe(LOCAL, peer_ref(port)), AnnounceOutcome::SelfEcho);
            prop_assert_eq!(dir.observe("", peer_ref(port)), AnnounceOutcome::Ignored);
        }
        prop_assert!(dir.is_empty());
        prop_assert!(!dir.contains(LOCAL));
    }

    /// Names come back sorted and without duplicates.
    #[test]
    fn names_sorted_and_unique(
        names in prop::collection::vec("[a-z]{1,6}", 0..32),
    ) {
        let mut dir = PeerDirectory::new(LOCAL);
        for (i, name) in names.iter().enumerate() {
            dir.observe_at(name, peer_ref(4061), i as u64);
        }

        let listed = dir.names();
        let mut expected: Vec<String> =
            names.into_iter().filter(|n| n != LOCAL).collect();
        expected.sort();
        expected.dedup();
        prop_assert_eq!(listed, expected);
    }

    /// Pruning removes exactly the entries last seen before the cutoff.
    #[test]
    fn prune_respects_cutoff(
        seen in prop::collection::vec(("[a-h]", 0..10_000u64), 0..32),
        cutoff in 0..10_000u64,
    ) {
        let mut dir = PeerDirectory::new(LOCAL);
        let mut last: HashMap<String, u64> = HashMap::new();
        for (name, at) in &seen {
            dir.observe_at(name, peer_ref(4061), *at);
            last.insert(name.clone(), *at);
        }

        let pruned = dir.prune_older_than(cutoff);
        for name in &pruned {
            prop_assert!(last[name] < cutoff);
            prop_assert!(!dir.contains(name));
        }
        for name in dir.names() {
            prop_assert!(last[&name] >= cutoff);
        }
    }
}
