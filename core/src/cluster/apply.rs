//! Deterministic state-transition functions, one per command kind.
//!
//! Every function is total: applying a command to a state it does not affect
//! returns an equivalent state. Containers are rebuilt along the spine from
//! the root to the modified leaf; untouched siblings keep their `Arc`s.

use super::{
    ClusterConsumerGroup, ClusterNamespace, ClusterNode, ClusterSegment, ClusterState,
    ClusterTopic, Command, NodeId, OffsetCommit, SegmentId, SegmentKind, SegmentNodes,
};
use crate::protocol::NamespaceName;
use std::sync::Arc;

impl ClusterState {
    /// Compute the successor state for `cmd`. Pure; the caller stamps the log
    /// index and publishes the result.
    pub fn apply_command(&self, cmd: &Command) -> ClusterState {
        match cmd {
            Command::NamespaceCreate { namespace } => self.do_namespace_create(namespace),
            Command::NamespaceDelete { namespace } => self.do_namespace_delete(namespace),
            Command::TopicCreate { namespace, topic } => self.do_topic_create(namespace, topic),
            Command::TopicDelete { namespace, name } => self.do_topic_delete(namespace, name),
            Command::ConsumerGroupCreate {
                namespace,
                consumer_group,
            } => self.do_consumer_group_create(namespace, consumer_group),
            Command::ConsumerGroupDelete { namespace, name } => {
                self.do_consumer_group_delete(namespace, name)
            }
            Command::ConsumerGroupOffsetCommitsUpdate {
                namespace,
                name,
                offset_commits,
            } => self.do_offset_commits_update(namespace, name, offset_commits),
            Command::SegmentOpen {
                id,
                kind,
                owner,
                primary_node_id,
                opened_at,
                first_message_id,
            } => self.do_segment_open(*id, *kind, owner, *primary_node_id, *opened_at, first_message_id),
            Command::SegmentClose {
                id,
                done_node_id: _,
                closed_at,
                size,
                checksum,
            } => self.do_segment_close(*id, *closed_at, *size, *checksum),
            Command::SegmentNodesUpdate { id, nodes } => self.do_segment_nodes_update(*id, nodes),
            Command::SegmentDelete { id } => self.do_segment_delete(*id),
            Command::NodeUpdate { node } => self.do_node_update(node),
        }
    }

    fn do_namespace_create(&self, name: &str) -> ClusterState {
        if self.find_namespace(name).is_some() {
            return self.clone();
        }
        let mut next = self.clone();
        next.namespaces.push(Arc::new(ClusterNamespace {
            name: name.to_string(),
            ..Default::default()
        }));
        next
    }

    fn do_namespace_delete(&self, name: &str) -> ClusterState {
        let Some(index) = self.namespace_index(name) else {
            return self.clone();
        };
        let mut next = self.clone();
        next.namespaces.remove(index);
        // segments owned by any child of the namespace go with it
        next.open_segments.retain(|s| s.owner.namespace != name);
        next.closed_segments.retain(|s| s.owner.namespace != name);
        next
    }

    fn do_topic_create(&self, namespace: &str, topic: &ClusterTopic) -> ClusterState {
        let mut next = self.clone();
        let (pos, mut ns) = match self.namespace_index(namespace) {
            Some(i) => {
                let ns = (*self.namespaces[i]).clone();
                next.namespaces.remove(i);
                (i, ns)
            }
            None => (
                next.namespaces.len(),
                ClusterNamespace {
                    name: namespace.to_string(),
                    ..Default::default()
                },
            ),
        };
        match ns.topic_index(&topic.name) {
            Some(t) => ns.topics[t] = Arc::new(topic.clone()),
            None => ns.topics.push(Arc::new(topic.clone())),
        }
        next.namespaces.insert(pos, Arc::new(ns));
        next
    }

    fn do_topic_delete(&self, namespace: &str, name: &str) -> ClusterState {
        let Some(i) = self.namespace_index(namespace) else {
            return self.clone();
        };
        let Some(t) = self.namespaces[i].topic_index(name) else {
            return self.clone();
        };

        let mut next = self.clone();
        let mut ns = (*self.namespaces[i]).clone();
        ns.topics.remove(t);
        if ns.is_empty() {
            next.namespaces.remove(i);
        } else {
            next.namespaces[i] = Arc::new(ns);
        }

        let owner = NamespaceName::new(namespace, name);
        next.open_segments
            .retain(|s| !(s.kind == SegmentKind::Topic && s.owner == owner));
        next.closed_segments
            .retain(|s| !(s.kind == SegmentKind::Topic && s.owner == owner));
        next
    }

    fn do_consumer_group_create(
        &self,
        namespace: &str,
        consumer_group: &ClusterConsumerGroup,
    ) -> ClusterState {
        let mut next = self.clone();
        let (pos, mut ns) = match self.namespace_index(namespace) {
            Some(i) => {
                let ns = (*self.namespaces[i]).clone();
                next.namespaces.remove(i);
                (i, ns)
            }
            None => (
                next.namespaces.len(),
                ClusterNamespace {
                    name: namespace.to_string(),
                    ..Default::default()
                },
            ),
        };

        match ns.consumer_group_index(&consumer_group.name) {
            Some(g) => {
                // recreation replaces bindings and size but keeps the
                // existing since cutoff and committed offsets
                let existing = &ns.consumer_groups[g];
                let mut updated = consumer_group.clone();
                if existing.since != 0 {
                    updated.since = existing.since;
                }
                updated.offset_commits = existing.offset_commits.clone();
                ns.consumer_groups[g] = Arc::new(updated);
            }
            None => ns.consumer_groups.push(Arc::new(consumer_group.clone())),
        }
        next.namespaces.insert(pos, Arc::new(ns));
        next
    }

    fn do_consumer_group_delete(&self, namespace: &str, name: &str) -> ClusterState {
        let Some(i) = self.namespace_index(namespace) else {
            return self.clone();
        };
        let Some(g) = self.namespaces[i].consumer_group_index(name) else {
            return self.clone();
        };

        let mut next = self.clone();
        let mut ns = (*self.namespaces[i]).clone();
        ns.consumer_groups.remove(g);
        if ns.is_empty() {
            next.namespaces.remove(i);
        } else {
            next.namespaces[i] = Arc::new(ns);
        }

        let owner = NamespaceName::new(namespace, name);
        next.open_segments.retain(|s| {
            !(s.kind == SegmentKind::ConsumerGroupOffsetCommits && s.owner == owner)
        });
        next.closed_segments.retain(|s| {
            !(s.kind == SegmentKind::ConsumerGroupOffsetCommits && s.owner == owner)
        });
        next
    }

    fn do_offset_commits_update(
        &self,
        namespace: &str,
        name: &str,
        offset_commits: &[OffsetCommit],
    ) -> ClusterState {
        let Some(i) = self.namespace_index(namespace) else {
            return self.clone();
        };
        let Some(g) = self.namespaces[i].consumer_group_index(name) else {
            return self.clone();
        };

        let mut next = self.clone();
        let mut ns = (*self.namespaces[i]).clone();
        let mut group = (*ns.consumer_groups[g]).clone();
        group.offset_commits = offset_commits.to_vec();
        group.offset_commits.sort_by_key(|c| c.segment_id);
        ns.consumer_groups[g] = Arc::new(group);
        next.namespaces[i] = Arc::new(ns);
        next
    }

    fn do_segment_open(
        &self,
        id: SegmentId,
        kind: SegmentKind,
        owner: &NamespaceName,
        primary_node_id: NodeId,
        opened_at: u64,
        first_message_id: &[u8],
    ) -> ClusterState {
        if self.get_open_segment(id).is_some() || self.get_closed_segment(id).is_some() {
            return self.clone();
        }
        let mut next = self.clone();
        next.current_segment_id = next.current_segment_id.max(id);
        next.open_segments.push(Arc::new(ClusterSegment {
            id,
            kind,
            owner: owner.clone(),
            nodes: SegmentNodes {
                primary_node_id,
                replica_node_ids: Vec::new(),
            },
            opened_at,
            closed_at: None,
            size: 0,
            checksum: None,
            first_message_id: first_message_id.to_vec(),
        }));
        next
    }

    fn do_segment_close(
        &self,
        id: SegmentId,
        closed_at: u64,
        size: u64,
        checksum: u32,
    ) -> ClusterState {
        let Some(pos) = self.open_segments.iter().position(|s| s.id == id) else {
            return self.clone();
        };
        let mut next = self.clone();
        let mut segment = (*next.open_segments.remove(pos)).clone();
        segment.closed_at = Some(closed_at.max(segment.opened_at));
        segment.size = size;
        segment.checksum = Some(checksum);
        next.closed_segments.push(Arc::new(segment));
        next.closed_segments.sort_by_key(|s| s.id);
        next
    }

    fn do_segment_nodes_update(&self, id: SegmentId, nodes: &SegmentNodes) -> ClusterState {
        let Some(pos) = self.open_segments.iter().position(|s| s.id == id) else {
            return self.clone();
        };
        let mut next = self.clone();
        let mut segment = (*next.open_segments[pos]).clone();
        segment.nodes = nodes.clone();
        next.open_segments[pos] = Arc::new(segment);
        next
    }

    fn do_segment_delete(&self, id: SegmentId) -> ClusterState {
        let mut next = self.clone();
        next.open_segments.retain(|s| s.id != id);
        next.closed_segments.retain(|s| s.id != id);
        next
    }

    fn do_node_update(&self, node: &ClusterNode) -> ClusterState {
        let mut next = self.clone();
        match next.nodes.iter().position(|n| n.id == node.id) {
            Some(pos) => next.nodes[pos] = Arc::new(node.clone()),
            None => next.nodes.push(Arc::new(node.clone())),
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeState, TopicKind};
    use std::time::Duration;

    fn topic(name: &str, kind: TopicKind) -> ClusterTopic {
        ClusterTopic {
            name: name.to_string(),
            kind,
            shards: 1,
            replication_factor: 1,
            retention: Duration::from_secs(3600),
        }
    }

    fn group(name: &str) -> ClusterConsumerGroup {
        ClusterConsumerGroup {
            name: name.to_string(),
            size: 1024,
            since: 42,
            bindings: Vec::new(),
            offset_commits: Vec::new(),
        }
    }

    #[test]
    fn topic_create_creates_namespace() {
        let state = ClusterState::default();
        let next = state.apply_command(&Command::TopicCreate {
            namespace: "default".to_string(),
            topic: topic("events", TopicKind::Fanout),
        });
        assert!(next.get_topic("default", "events").is_some());
        assert!(state.find_namespace("default").is_none(), "old snapshot unchanged");
    }

    #[test]
    fn last_child_removal_collects_namespace() {
        let state = ClusterState::default()
            .apply_command(&Command::TopicCreate {
                namespace: "default".to_string(),
                topic: topic("events", TopicKind::Fanout),
            })
            .apply_command(&Command::TopicDelete {
                namespace: "default".to_string(),
                name: "events".to_string(),
            });
        assert!(state.find_namespace("default").is_none());
    }

    #[test]
    fn namespace_survives_while_sibling_child_exists() {
        let state = ClusterState::default()
            .apply_command(&Command::TopicCreate {
                namespace: "default".to_string(),
                topic: topic("events", TopicKind::Fanout),
            })
            .apply_command(&Command::ConsumerGroupCreate {
                namespace: "default".to_string(),
                consumer_group: group("workers"),
            })
            .apply_command(&Command::TopicDelete {
                namespace: "default".to_string(),
                name: "events".to_string(),
            });
        assert!(state.find_namespace("default").is_some());
        assert!(state.find_consumer_group("default", "workers").is_some());
    }

    #[test]
    fn group_recreation_keeps_since_and_offsets() {
        let mut recreated = group("workers");
        recreated.since = 9000;
        let state = ClusterState::default()
            .apply_command(&Command::ConsumerGroupCreate {
                namespace: "default".to_string(),
                consumer_group: group("workers"),
            })
            .apply_command(&Command::ConsumerGroupOffsetCommitsUpdate {
                namespace: "default".to_string(),
                name: "workers".to_string(),
                offset_commits: vec![OffsetCommit {
                    segment_id: 3,
                    offset: 17,
                }],
            })
            .apply_command(&Command::ConsumerGroupCreate {
                namespace: "default".to_string(),
                consumer_group: recreated,
            });

        let g = state.find_consumer_group("default", "workers").unwrap();
        assert_eq!(g.since, 42);
        assert_eq!(g.offset_commits.len(), 1);
    }

    #[test]
    fn offset_commits_kept_sorted_by_segment_id() {
        let state = ClusterState::default()
            .apply_command(&Command::ConsumerGroupCreate {
                namespace: "default".to_string(),
                consumer_group: group("workers"),
            })
            .apply_command(&Command::ConsumerGroupOffsetCommitsUpdate {
                namespace: "default".to_string(),
                name: "workers".to_string(),
                offset_commits: vec![
                    OffsetCommit {
                        segment_id: 7,
                        offset: 1,
                    },
                    OffsetCommit {
                        segment_id: 2,
                        offset: 5,
                    },
                ],
            });
        let g = state.find_consumer_group("default", "workers").unwrap();
        let ids: Vec<_> = g.offset_commits.iter().map(|c| c.segment_id).collect();
        assert_eq!(ids, vec![2, 7]);
    }

    #[test]
    fn segment_close_moves_to_closed_and_guards_clock_skew() {
        let owner = NamespaceName::new("default", "events");
        let state = ClusterState::default()
            .apply_command(&Command::SegmentOpen {
                id: 1,
                kind: SegmentKind::Topic,
                owner: owner.clone(),
                primary_node_id: 10,
                opened_at: 1000,
                first_message_id: Vec::new(),
            })
            .apply_command(&Command::SegmentClose {
                id: 1,
                done_node_id: 10,
                closed_at: 500, // earlier than opened_at
                size: 64,
                checksum: 0xdead,
            });

        assert!(state.get_open_segment(1).is_none());
        let closed = state.get_closed_segment(1).unwrap();
        assert_eq!(closed.closed_at, Some(1000));
        assert_eq!(closed.size, 64);
    }

    #[test]
    fn topic_delete_cascades_to_segments() {
        let owner = NamespaceName::new("default", "events");
        let state = ClusterState::default()
            .apply_command(&Command::TopicCreate {
                namespace: "default".to_string(),
                topic: topic("events", TopicKind::Fanout),
            })
            .apply_command(&Command::SegmentOpen {
                id: 1,
                kind: SegmentKind::Topic,
                owner: owner.clone(),
                primary_node_id: 10,
                opened_at: 1000,
                first_message_id: Vec::new(),
            })
            .apply_command(&Command::TopicDelete {
                namespace: "default".to_string(),
                name: "events".to_string(),
            });
        assert!(state.open_segments.is_empty());
    }

    #[test]
    fn node_update_inserts_then_replaces() {
        let state = ClusterState::default()
            .apply_command(&Command::NodeUpdate {
                node: ClusterNode {
                    id: 1,
                    address: "127.0.0.1:5672".to_string(),
                    state: NodeState::Alive,
                },
            })
            .apply_command(&Command::NodeUpdate {
                node: ClusterNode {
                    id: 1,
                    address: "127.0.0.1:5672".to_string(),
                    state: NodeState::Dead,
                },
            });
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].state, NodeState::Dead);
    }

    #[test]
    fn transitions_share_untouched_subtrees() {
        let state = ClusterState::default()
            .apply_command(&Command::TopicCreate {
                namespace: "a".to_string(),
                topic: topic("events", TopicKind::Fanout),
            })
            .apply_command(&Command::TopicCreate {
                namespace: "b".to_string(),
                topic: topic("events", TopicKind::Fanout),
            });

        let next = state.apply_command(&Command::TopicCreate {
            namespace: "b".to_string(),
            topic: topic("more", TopicKind::Direct),
        });

        let before = state.find_namespace("a").unwrap();
        let after = next.find_namespace("a").unwrap();
        assert!(Arc::ptr_eq(before, after));
    }
}
