//! Drives open-segment existence from the catalog.
//!
//! Runs on the leader after leadership acquisition, node state changes,
//! consumer-group changes, and segment closes. Each pass converges to a fixed
//! point against the current snapshot, so re-running it is always safe.

use super::log::CommandLog;
use super::segments::SegmentCoordinator;
use super::store::ClusterStateStore;
use super::{ClusterState, Command, NodeState, SegmentKind, SegmentNodes};
use crate::protocol::NamespaceName;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on fixes per pass; a correct pass converges far below this.
const MAX_FIXES_PER_PASS: usize = 1024;

pub struct Reconciler {
    store: Arc<ClusterStateStore>,
    log: Arc<dyn CommandLog>,
    coordinator: Arc<SegmentCoordinator>,
    kick: Notify,
}

impl Reconciler {
    pub fn new(
        store: Arc<ClusterStateStore>,
        log: Arc<dyn CommandLog>,
        coordinator: Arc<SegmentCoordinator>,
    ) -> Self {
        Self {
            store,
            log,
            coordinator,
            kick: Notify::new(),
        }
    }

    /// Request a reconciliation pass soon (group created, node state changed,
    /// segment closed, leadership acquired).
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Background loop: reconcile on kick or on a steady interval.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.kick.notified() => {}
                _ = shutdown.recv() => {
                    info!("reconciler stopping");
                    return;
                }
            }
            if let Err(e) = self.reconcile().await {
                error!("reconciliation pass failed: {}", e);
            }
        }
    }

    /// Run one pass to fixed point. No-op on non-leaders.
    pub async fn reconcile(&self) -> Result<()> {
        if !self.log.is_leader() {
            return Ok(());
        }

        let _tx = self.coordinator.transaction().await;
        for _ in 0..MAX_FIXES_PER_PASS {
            let state = self.store.current();
            if !self.fix_one(&state).await? {
                return Ok(());
            }
        }
        error!("reconciliation did not converge, giving up this pass");
        Ok(())
    }

    /// Find and repair the first discrepancy between catalog and desired
    /// segment topology. Returns whether anything changed.
    async fn fix_one(&self, state: &ClusterState) -> Result<bool> {
        // every consumer group needs exactly one open offset-commits segment
        for namespace in &state.namespaces {
            for group in &namespace.consumer_groups {
                let owner = NamespaceName::new(&namespace.name, &group.name);
                if !state
                    .open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner)
                    .is_empty()
                {
                    continue;
                }
                let Some(primary) = SegmentCoordinator::pick_primary(state) else {
                    continue;
                };
                debug!("opening offset-commits segment for {} on node {}", owner, primary);
                self.coordinator
                    .open_locked(
                        state,
                        primary,
                        &owner,
                        SegmentKind::ConsumerGroupOffsetCommits,
                        Vec::new(),
                    )
                    .await?;
                return Ok(true);
            }
        }

        // sharded topics get shards-many open segments spread over live nodes
        for namespace in &state.namespaces {
            for topic in &namespace.topics {
                if topic.shards == 0 {
                    continue;
                }
                let owner = NamespaceName::new(&namespace.name, &topic.name);
                let open = state.open_segments_for(SegmentKind::Topic, &owner);
                if open.len() as u32 >= topic.shards {
                    continue;
                }
                let Some(primary) = self.pick_shard_primary(state, &owner) else {
                    continue;
                };
                debug!("opening shard segment for {} on node {}", owner, primary);
                self.coordinator
                    .open_locked(state, primary, &owner, SegmentKind::Topic, Vec::new())
                    .await?;
                return Ok(true);
            }
        }

        // reassign open segments whose primary died
        for segment in &state.open_segments {
            let alive = state
                .get_node(segment.nodes.primary_node_id)
                .map(|n| n.state == NodeState::Alive)
                .unwrap_or(false);
            if alive {
                continue;
            }
            let replacement = segment
                .nodes
                .replica_node_ids
                .iter()
                .copied()
                .find(|id| {
                    state
                        .get_node(*id)
                        .map(|n| n.state == NodeState::Alive)
                        .unwrap_or(false)
                })
                .or_else(|| SegmentCoordinator::pick_primary(state));
            let Some(replacement) = replacement else {
                continue;
            };
            info!(
                "reassigning segment {} primary {} -> {}",
                segment.id, segment.nodes.primary_node_id, replacement
            );
            self.log
                .apply(Command::SegmentNodesUpdate {
                    id: segment.id,
                    nodes: SegmentNodes {
                        primary_node_id: replacement,
                        replica_node_ids: segment.nodes.replica_node_ids.clone(),
                    },
                })
                .await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Least-loaded alive node that is not already primary for one of the
    /// topic's open segments; falls back to least-loaded overall.
    fn pick_shard_primary(
        &self,
        state: &ClusterState,
        owner: &NamespaceName,
    ) -> Option<super::NodeId> {
        let counts = state.count_segments_per_node();
        let taken: Vec<_> = state
            .open_segments_for(SegmentKind::Topic, owner)
            .iter()
            .map(|s| s.nodes.primary_node_id)
            .collect();

        state
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Alive && !taken.contains(&n.id))
            .min_by_key(|n| (counts.get(&n.id).copied().unwrap_or(0), n.id))
            .map(|n| n.id)
            .or_else(|| SegmentCoordinator::pick_primary(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::log::LocalCommandLog;
    use crate::cluster::{ClusterConsumerGroup, ClusterNode, ClusterTopic, TopicKind};

    async fn fixture() -> (Arc<ClusterStateStore>, Arc<dyn CommandLog>, Reconciler) {
        let store = Arc::new(ClusterStateStore::new());
        let log: Arc<dyn CommandLog> = Arc::new(LocalCommandLog::new(Arc::clone(&store), 1));
        let coordinator = Arc::new(SegmentCoordinator::new(Arc::clone(&store), Arc::clone(&log)));
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&log), coordinator);

        for id in [1, 2] {
            log.apply(Command::NodeUpdate {
                node: ClusterNode {
                    id,
                    address: format!("127.0.0.1:{}", 5670 + id),
                    state: NodeState::Alive,
                },
            })
            .await
            .unwrap();
        }
        (store, log, reconciler)
    }

    #[tokio::test]
    async fn opens_offset_commits_segment_for_each_group() {
        let (store, log, reconciler) = fixture().await;
        log.apply(Command::ConsumerGroupCreate {
            namespace: "default".to_string(),
            consumer_group: ClusterConsumerGroup {
                name: "workers".to_string(),
                size: 1024,
                since: 0,
                bindings: Vec::new(),
                offset_commits: Vec::new(),
            },
        })
        .await
        .unwrap();

        reconciler.reconcile().await.unwrap();

        let state = store.current();
        let owner = NamespaceName::new("default", "workers");
        assert_eq!(
            state
                .open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn opens_shard_segments_across_nodes() {
        let (store, log, reconciler) = fixture().await;
        log.apply(Command::TopicCreate {
            namespace: "default".to_string(),
            topic: ClusterTopic {
                name: "events".to_string(),
                kind: TopicKind::Fanout,
                shards: 2,
                replication_factor: 1,
                retention: Duration::from_secs(60),
            },
        })
        .await
        .unwrap();

        reconciler.reconcile().await.unwrap();

        let state = store.current();
        let owner = NamespaceName::new("default", "events");
        let open = state.open_segments_for(SegmentKind::Topic, &owner);
        assert_eq!(open.len(), 2);
        let mut primaries: Vec<_> = open.iter().map(|s| s.nodes.primary_node_id).collect();
        primaries.sort_unstable();
        assert_eq!(primaries, vec![1, 2]);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (store, log, reconciler) = fixture().await;
        log.apply(Command::ConsumerGroupCreate {
            namespace: "default".to_string(),
            consumer_group: ClusterConsumerGroup {
                name: "workers".to_string(),
                size: 1024,
                since: 0,
                bindings: Vec::new(),
                offset_commits: Vec::new(),
            },
        })
        .await
        .unwrap();

        reconciler.reconcile().await.unwrap();
        let first = store.current();
        reconciler.reconcile().await.unwrap();
        let second = store.current();

        assert_eq!(first.open_segments.len(), second.open_segments.len());
    }

    #[tokio::test]
    async fn reassigns_orphaned_segments() {
        let (store, log, reconciler) = fixture().await;
        log.apply(Command::ConsumerGroupCreate {
            namespace: "default".to_string(),
            consumer_group: ClusterConsumerGroup {
                name: "workers".to_string(),
                size: 1024,
                since: 0,
                bindings: Vec::new(),
                offset_commits: Vec::new(),
            },
        })
        .await
        .unwrap();
        reconciler.reconcile().await.unwrap();

        let owner = NamespaceName::new("default", "workers");
        let primary = store
            .current()
            .open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner)[0]
            .nodes
            .primary_node_id;

        log.apply(Command::NodeUpdate {
            node: ClusterNode {
                id: primary,
                address: format!("127.0.0.1:{}", 5670 + primary),
                state: NodeState::Dead,
            },
        })
        .await
        .unwrap();

        reconciler.reconcile().await.unwrap();

        let state = store.current();
        let segment = &state.open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner)[0];
        assert_ne!(segment.nodes.primary_node_id, primary);
    }
}
