//! # Cluster Catalog
//!
//! The replicated cluster state machine. The catalog is an immutable snapshot
//! graph ([`ClusterState`]) mutated exclusively through an ordered command log
//! (see [`command::Command`]) and shared lock-free with readers through
//! [`store::ClusterStateStore`].
//!
//! Children are held as `Vec<Arc<_>>` so a snapshot transition rebuilds only
//! the spine from the root to the modified leaf; sibling subtrees are shared
//! between the old and new snapshot.

pub mod apply;
pub mod command;
pub mod log;
pub mod reconciler;
pub mod segments;
pub mod store;

use crate::protocol::NamespaceName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use command::Command;

/// Stable 64-bit node identifier. Zero is reserved (means "no node").
pub type NodeId = u64;

/// Globally unique, strictly monotonic segment identifier.
pub type SegmentId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Alive,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    /// host:port the node's peers dial.
    pub address: String,
    pub state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl TopicKind {
    /// Parse the AMQP exchange-type string used on the 0-9-1 wire.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(TopicKind::Direct),
            "fanout" => Some(TopicKind::Fanout),
            "topic" => Some(TopicKind::Topic),
            "headers" => Some(TopicKind::Headers),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopic {
    pub name: String,
    pub kind: TopicKind,
    /// Maximum number of concurrently open segments. Zero means unlimited.
    pub shards: u32,
    pub replication_factor: u32,
    pub retention: Duration,
}

/// Declarative rule linking a topic to a consumer group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub topic_name: String,
    pub by: BindingMatch,
}

/// Match clause of a binding. A closed sum; routing dispatches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BindingMatch {
    /// Fanout topics carry no match clause.
    Fanout,
    /// Exact key for DIRECT topics, `*`/`#` pattern for TOPIC topics.
    RoutingKey(String),
    /// Every (name, value) pair must be present and equal.
    HeadersAll(crate::protocol::FieldTable),
    /// At least one (name, value) pair must be present and equal.
    HeadersAny(crate::protocol::FieldTable),
}

/// Committed consumer position within one source segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommit {
    pub segment_id: SegmentId,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConsumerGroup {
    pub name: String,
    /// Maximum queued-undelivered messages, also the default subscription
    /// credit.
    pub size: u32,
    /// Unix milliseconds; messages with an earlier timestamp are not
    /// delivered to this group.
    pub since: u64,
    pub bindings: Vec<Binding>,
    /// Sorted by segment id.
    pub offset_commits: Vec<OffsetCommit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    Topic,
    ConsumerGroupOffsetCommits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentNodes {
    /// The only node allowed to append to this segment while open.
    pub primary_node_id: NodeId,
    pub replica_node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSegment {
    pub id: SegmentId,
    pub kind: SegmentKind,
    /// Owning topic or consumer group, depending on `kind`.
    pub owner: NamespaceName,
    pub nodes: SegmentNodes,
    /// Unix milliseconds.
    pub opened_at: u64,
    /// Unix milliseconds; set when the segment is closed. Never earlier than
    /// `opened_at`.
    pub closed_at: Option<u64>,
    pub size: u64,
    /// Content checksum, recorded at close.
    pub checksum: Option<u32>,
    pub first_message_id: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterNamespace {
    pub name: String,
    pub topics: Vec<Arc<ClusterTopic>>,
    pub consumer_groups: Vec<Arc<ClusterConsumerGroup>>,
}

impl ClusterNamespace {
    /// A namespace with no children is garbage-collected by the applier.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.consumer_groups.is_empty()
    }

    pub fn find_topic(&self, name: &str) -> Option<&Arc<ClusterTopic>> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn find_consumer_group(&self, name: &str) -> Option<&Arc<ClusterConsumerGroup>> {
        self.consumer_groups.iter().find(|g| g.name == name)
    }

    pub(crate) fn topic_index(&self, name: &str) -> Option<usize> {
        self.topics.iter().position(|t| t.name == name)
    }

    pub(crate) fn consumer_group_index(&self, name: &str) -> Option<usize> {
        self.consumer_groups.iter().position(|g| g.name == name)
    }
}

/// Root of the catalog snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    /// Log index of the last applied command; non-decreasing.
    pub index: u64,
    /// High-water mark of allocated segment ids.
    pub current_segment_id: SegmentId,
    pub namespaces: Vec<Arc<ClusterNamespace>>,
    pub nodes: Vec<Arc<ClusterNode>>,
    pub open_segments: Vec<Arc<ClusterSegment>>,
    pub closed_segments: Vec<Arc<ClusterSegment>>,
}

impl ClusterState {
    pub fn find_namespace(&self, name: &str) -> Option<&Arc<ClusterNamespace>> {
        self.namespaces.iter().find(|n| n.name == name)
    }

    pub(crate) fn namespace_index(&self, name: &str) -> Option<usize> {
        self.namespaces.iter().position(|n| n.name == name)
    }

    pub fn get_topic(&self, namespace: &str, name: &str) -> Option<&Arc<ClusterTopic>> {
        self.find_namespace(namespace)?.find_topic(name)
    }

    pub fn find_consumer_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<&Arc<ClusterConsumerGroup>> {
        self.find_namespace(namespace)?.find_consumer_group(name)
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Arc<ClusterNode>> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn get_open_segment(&self, id: SegmentId) -> Option<&Arc<ClusterSegment>> {
        self.open_segments.iter().find(|s| s.id == id)
    }

    pub fn get_closed_segment(&self, id: SegmentId) -> Option<&Arc<ClusterSegment>> {
        self.closed_segments.iter().find(|s| s.id == id)
    }

    /// Open segments owned by `owner` with the given role.
    pub fn open_segments_for(
        &self,
        kind: SegmentKind,
        owner: &NamespaceName,
    ) -> Vec<&Arc<ClusterSegment>> {
        self.open_segments
            .iter()
            .filter(|s| s.kind == kind && &s.owner == owner)
            .collect()
    }

    /// Number of open segments each node is primary for. Nodes with no
    /// segments are absent from the map.
    pub fn count_segments_per_node(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for segment in &self.open_segments {
            *counts.entry(segment.nodes.primary_node_id).or_insert(0) += 1;
        }
        counts
    }
}
