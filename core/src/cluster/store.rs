//! Copy-on-write cluster state store.
//!
//! A single shared pointer to the current snapshot root. Readers load it
//! wait-free; writers publish a successor through a compare-and-swap loop.
//! Readers that captured an older root stay consistent for the duration of
//! their operation.

use super::{ClusterState, Command, SegmentId};
use arc_swap::ArcSwap;
use std::sync::Arc;

pub struct ClusterStateStore {
    root: ArcSwap<ClusterState>,
}

impl Default for ClusterStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateStore {
    pub fn new() -> Self {
        Self {
            root: ArcSwap::from_pointee(ClusterState::default()),
        }
    }

    /// Current snapshot root. Wait-free; never copies.
    pub fn current(&self) -> Arc<ClusterState> {
        self.root.load_full()
    }

    /// Apply `cmd` at log `index` and publish the successor root.
    ///
    /// `None` advances the index only. Transition functions are pure, so
    /// retrying on CAS contention is safe.
    pub fn apply(&self, index: u64, cmd: Option<&Command>) {
        self.root.rcu(|state| {
            let mut next = match cmd {
                Some(cmd) => state.apply_command(cmd),
                None => (**state).clone(),
            };
            next.index = index;
            Arc::new(next)
        });
    }

    /// Allocate a fresh segment id by bumping the counter in the root.
    /// Strictly increasing within this store instance.
    pub fn next_segment_id(&self) -> SegmentId {
        let prev = self.root.rcu(|state| {
            let mut next = (**state).clone();
            next.current_segment_id += 1;
            Arc::new(next)
        });
        prev.current_segment_id + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterTopic, TopicKind};
    use std::time::Duration;

    fn topic_create(namespace: &str, name: &str) -> Command {
        Command::TopicCreate {
            namespace: namespace.to_string(),
            topic: ClusterTopic {
                name: name.to_string(),
                kind: TopicKind::Fanout,
                shards: 1,
                replication_factor: 1,
                retention: Duration::from_secs(60),
            },
        }
    }

    #[test]
    fn current_reflects_latest_apply() {
        let store = ClusterStateStore::new();
        store.apply(1, Some(&topic_create("default", "a")));
        store.apply(2, Some(&topic_create("default", "b")));

        let state = store.current();
        assert_eq!(state.index, 2);
        assert!(state.get_topic("default", "a").is_some());
        assert!(state.get_topic("default", "b").is_some());
    }

    #[test]
    fn nil_command_advances_index_only() {
        let store = ClusterStateStore::new();
        store.apply(1, Some(&topic_create("default", "a")));
        store.apply(7, None);

        let state = store.current();
        assert_eq!(state.index, 7);
        assert!(state.get_topic("default", "a").is_some());
    }

    #[test]
    fn captured_snapshots_are_stable() {
        let store = ClusterStateStore::new();
        store.apply(1, Some(&topic_create("default", "a")));
        let snapshot = store.current();

        store.apply(2, Some(&topic_create("default", "b")));

        assert_eq!(snapshot.index, 1);
        assert!(snapshot.get_topic("default", "b").is_none());
        assert_eq!(store.current().index, 2);
    }

    #[test]
    fn segment_ids_strictly_increase() {
        let store = ClusterStateStore::new();
        let mut last = 0;
        for _ in 0..100 {
            let id = store.next_segment_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn segment_ids_unique_under_contention() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        let store = Arc::new(ClusterStateStore::new());
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let id = store.next_segment_id();
                        assert!(seen.lock().unwrap().insert(id), "duplicate id {}", id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 400);
    }
}
