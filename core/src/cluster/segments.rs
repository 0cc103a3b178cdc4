//! Segment coordination: allocation of segment ids, primary-node assignment,
//! and rotation on size. The coordinator never touches segment bytes; the
//! local segment manager owns those and reports size and checksum on
//! rotation.

use super::log::CommandLog;
use super::store::ClusterStateStore;
use super::{ClusterState, Command, NodeId, SegmentId, SegmentKind};
use crate::protocol::{now_millis, NamespaceName};
use crate::{Entity, MeshmqError, Result};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of an open/rotate call: which segment to append to and who is
/// allowed to append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAssignment {
    pub segment_id: SegmentId,
    pub primary_node_id: NodeId,
}

pub struct SegmentCoordinator {
    store: Arc<ClusterStateStore>,
    log: Arc<dyn CommandLog>,
    /// Node-wide transaction lock. Leader-side catalog mutations are
    /// read-modify-write sequences of several log appends; this keeps them
    /// from interleaving.
    tx_lock: Mutex<()>,
}

impl SegmentCoordinator {
    pub fn new(store: Arc<ClusterStateStore>, log: Arc<dyn CommandLog>) -> Self {
        Self {
            store,
            log,
            tx_lock: Mutex::new(()),
        }
    }

    /// Serialize a leader-side catalog transaction. Held across multi-append
    /// operations by the broker's op handlers.
    pub async fn transaction(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.tx_lock.lock().await
    }

    /// Ensure an open segment exists that `node_id` can append to for
    /// `(owner, kind)`.
    pub async fn open(
        &self,
        node_id: NodeId,
        owner: NamespaceName,
        kind: SegmentKind,
        first_message_id: Vec<u8>,
    ) -> Result<SegmentAssignment> {
        let _tx = self.tx_lock.lock().await;
        self.open_locked(&self.store.current(), node_id, &owner, kind, first_message_id)
            .await
    }

    /// As [`open`](Self::open) but assumes the caller already holds the
    /// transaction lock.
    pub(crate) async fn open_locked(
        &self,
        state: &ClusterState,
        node_id: NodeId,
        owner: &NamespaceName,
        kind: SegmentKind,
        first_message_id: Vec<u8>,
    ) -> Result<SegmentAssignment> {
        let open_segments = state.open_segments_for(kind, owner);

        // the node's existing open segment wins
        for segment in &open_segments {
            if segment.nodes.primary_node_id == node_id {
                return Ok(SegmentAssignment {
                    segment_id: segment.id,
                    primary_node_id: node_id,
                });
            }
        }

        match kind {
            SegmentKind::ConsumerGroupOffsetCommits => {
                // at most one open offset-commits segment per group
                if let Some(segment) = open_segments.first() {
                    return Ok(SegmentAssignment {
                        segment_id: segment.id,
                        primary_node_id: segment.nodes.primary_node_id,
                    });
                }
                if state
                    .find_consumer_group(&owner.namespace, &owner.name)
                    .is_none()
                {
                    return Err(MeshmqError::not_found(
                        Entity::ConsumerGroup,
                        owner.to_string(),
                    ));
                }
            }
            SegmentKind::Topic => {
                let topic = state
                    .get_topic(&owner.namespace, &owner.name)
                    .ok_or_else(|| MeshmqError::not_found(Entity::Topic, owner.to_string()))?;

                // shard cap reached: share load on a random existing segment
                if topic.shards > 0 && open_segments.len() as u32 >= topic.shards {
                    let segment =
                        open_segments[rand::thread_rng().gen_range(0..open_segments.len())];
                    return Ok(SegmentAssignment {
                        segment_id: segment.id,
                        primary_node_id: segment.nodes.primary_node_id,
                    });
                }
            }
        }

        let segment_id = self.store.next_segment_id();
        self.log
            .apply(Command::SegmentOpen {
                id: segment_id,
                kind,
                owner: owner.clone(),
                primary_node_id: node_id,
                opened_at: now_millis(),
                first_message_id,
            })
            .await?;

        Ok(SegmentAssignment {
            segment_id,
            primary_node_id: node_id,
        })
    }

    /// Close a full segment and open a fresh one for the same owner and node.
    /// Must be called by the segment's current primary.
    pub async fn rotate(
        &self,
        old_segment_id: SegmentId,
        node_id: NodeId,
        old_size: u64,
        old_checksum: u32,
    ) -> Result<SegmentAssignment> {
        let _tx = self.tx_lock.lock().await;
        let state = self.store.current();

        let (owner, kind) = match state.get_open_segment(old_segment_id) {
            Some(segment) => {
                if segment.nodes.primary_node_id != node_id {
                    return Err(MeshmqError::PreconditionFailed(format!(
                        "node {} is not primary for segment {}",
                        node_id, old_segment_id
                    )));
                }

                self.log
                    .apply(Command::SegmentClose {
                        id: segment.id,
                        done_node_id: node_id,
                        closed_at: now_millis().max(segment.opened_at),
                        size: old_size,
                        checksum: old_checksum,
                    })
                    .await?;

                // fence: the close must be visible before the re-open decides
                self.log.barrier(super::log::BARRIER_TIMEOUT).await?;

                (segment.owner.clone(), segment.kind)
            }
            None => {
                // already rotated by a retry; fall through to re-open
                let segment = state.get_closed_segment(old_segment_id).ok_or_else(|| {
                    MeshmqError::not_found(Entity::Segment, old_segment_id.to_string())
                })?;
                (segment.owner.clone(), segment.kind)
            }
        };

        let state = self.store.current();
        self.open_locked(&state, node_id, &owner, kind, Vec::new())
            .await
    }

    /// Pick a primary for a new segment: the ALIVE node with the fewest open
    /// segments, ties broken by the lowest node id.
    pub fn pick_primary(state: &ClusterState) -> Option<NodeId> {
        let counts = state.count_segments_per_node();
        state
            .nodes
            .iter()
            .filter(|n| n.state == super::NodeState::Alive)
            .min_by_key(|n| (counts.get(&n.id).copied().unwrap_or(0), n.id))
            .map(|n| n.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::log::LocalCommandLog;
    use crate::cluster::{ClusterNode, ClusterTopic, NodeState, TopicKind};
    use std::time::Duration;

    fn coordinator() -> (Arc<ClusterStateStore>, Arc<dyn CommandLog>, SegmentCoordinator) {
        let store = Arc::new(ClusterStateStore::new());
        let log: Arc<dyn CommandLog> = Arc::new(LocalCommandLog::new(Arc::clone(&store), 1));
        let coordinator = SegmentCoordinator::new(Arc::clone(&store), Arc::clone(&log));
        (store, log, coordinator)
    }

    async fn seed_topic(log: &Arc<dyn CommandLog>, shards: u32) {
        log.apply(Command::TopicCreate {
            namespace: "default".to_string(),
            topic: ClusterTopic {
                name: "events".to_string(),
                kind: TopicKind::Fanout,
                shards,
                replication_factor: 1,
                retention: Duration::from_secs(60),
            },
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn open_is_idempotent_per_node() {
        let (_store, log, coordinator) = coordinator();
        seed_topic(&log, 2).await;
        let owner = NamespaceName::new("default", "events");

        let first = coordinator
            .open(1, owner.clone(), SegmentKind::Topic, Vec::new())
            .await
            .unwrap();
        let second = coordinator
            .open(1, owner, SegmentKind::Topic, Vec::new())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn shard_cap_reuses_existing_segment() {
        let (store, log, coordinator) = coordinator();
        seed_topic(&log, 1).await;
        let owner = NamespaceName::new("default", "events");

        let first = coordinator
            .open(1, owner.clone(), SegmentKind::Topic, Vec::new())
            .await
            .unwrap();
        // another node asks, but the topic has a single shard
        let second = coordinator
            .open(2, owner, SegmentKind::Topic, Vec::new())
            .await
            .unwrap();

        assert_eq!(first.segment_id, second.segment_id);
        assert_eq!(second.primary_node_id, 1);
        assert_eq!(store.current().open_segments.len(), 1);
    }

    #[tokio::test]
    async fn rotate_closes_and_reopens() {
        let (store, log, coordinator) = coordinator();
        seed_topic(&log, 0).await;
        let owner = NamespaceName::new("default", "events");

        let first = coordinator
            .open(1, owner, SegmentKind::Topic, Vec::new())
            .await
            .unwrap();
        let next = coordinator
            .rotate(first.segment_id, 1, 4096, 0xfeed)
            .await
            .unwrap();

        assert_ne!(first.segment_id, next.segment_id);
        let state = store.current();
        let closed = state.get_closed_segment(first.segment_id).unwrap();
        assert_eq!(closed.size, 4096);
        assert_eq!(closed.checksum, Some(0xfeed));
        assert!(state.get_open_segment(next.segment_id).is_some());
    }

    #[tokio::test]
    async fn rotate_rejects_non_primary() {
        let (_store, log, coordinator) = coordinator();
        seed_topic(&log, 0).await;
        let owner = NamespaceName::new("default", "events");

        let assignment = coordinator
            .open(1, owner, SegmentKind::Topic, Vec::new())
            .await
            .unwrap();
        let err = coordinator
            .rotate(assignment.segment_id, 2, 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshmqError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn primary_pick_prefers_least_loaded_alive_node() {
        let (store, log, _coordinator) = coordinator();
        for (id, state) in [(1, NodeState::Alive), (2, NodeState::Alive), (3, NodeState::Dead)] {
            log.apply(Command::NodeUpdate {
                node: ClusterNode {
                    id,
                    address: format!("127.0.0.1:{}", 5670 + id),
                    state,
                },
            })
            .await
            .unwrap();
        }
        seed_topic(&log, 0).await;
        log.apply(Command::SegmentOpen {
            id: 1,
            kind: SegmentKind::Topic,
            owner: NamespaceName::new("default", "events"),
            primary_node_id: 1,
            opened_at: 0,
            first_message_id: Vec::new(),
        })
        .await
        .unwrap();

        assert_eq!(SegmentCoordinator::pick_primary(&store.current()), Some(2));
    }
}
