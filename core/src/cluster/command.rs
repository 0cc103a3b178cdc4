//! Catalog commands, totally ordered by the replicated log and applied
//! deterministically on every node.

use super::{
    ClusterConsumerGroup, ClusterNode, ClusterTopic, NodeId, OffsetCommit, SegmentId, SegmentKind,
    SegmentNodes,
};
use crate::protocol::NamespaceName;
use serde::{Deserialize, Serialize};

/// One catalog mutation. Each variant carries the identity of its subject and
/// the full replacement value where applicable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    NamespaceCreate {
        namespace: String,
    },
    NamespaceDelete {
        namespace: String,
    },
    TopicCreate {
        namespace: String,
        topic: ClusterTopic,
    },
    TopicDelete {
        namespace: String,
        name: String,
    },
    ConsumerGroupCreate {
        namespace: String,
        consumer_group: ClusterConsumerGroup,
    },
    ConsumerGroupDelete {
        namespace: String,
        name: String,
    },
    ConsumerGroupOffsetCommitsUpdate {
        namespace: String,
        name: String,
        offset_commits: Vec<OffsetCommit>,
    },
    SegmentOpen {
        id: SegmentId,
        kind: SegmentKind,
        owner: NamespaceName,
        primary_node_id: NodeId,
        opened_at: u64,
        first_message_id: Vec<u8>,
    },
    SegmentClose {
        id: SegmentId,
        done_node_id: NodeId,
        closed_at: u64,
        size: u64,
        checksum: u32,
    },
    SegmentNodesUpdate {
        id: SegmentId,
        nodes: SegmentNodes,
    },
    SegmentDelete {
        id: SegmentId,
    },
    NodeUpdate {
        node: ClusterNode,
    },
}
