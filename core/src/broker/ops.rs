//! Broker operations: the catalog and data-plane surface reachable from
//! both AMQP sessions and node RPC.
//!
//! Catalog mutations follow one shape: validate, leader guard (forward once
//! to the current leader when this node is not it), take the node-wide
//! transaction lock, append commands, barrier, reconcile side effects. The
//! returned log index lets callers wait for the mutation on any node.

use super::rpc::{self, Envelope, Request, Response, WireDelivery};
use super::{Broker, SubscriberStream};
use crate::cluster::segments::SegmentAssignment;
use crate::cluster::{
    BindingMatch, ClusterConsumerGroup, ClusterTopic, Command, NodeId, OffsetCommit, SegmentId,
    SegmentKind, TopicKind,
};
use crate::consumers::{SeqNo, SubscriptionId};
use crate::protocol::{now_millis, Message, NamespaceName};
use crate::routing::message_matches;
use crate::{Entity, MeshmqError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Default max inflight for consumer groups declared without a size.
pub const DEFAULT_CONSUMER_GROUP_SIZE: u32 = 1024;

const DEFAULT_REPLICATION_FACTOR: u32 = 1;

impl Broker {
    // ---- leader guard plumbing ----

    async fn forward_to_leader(&self, request: Request) -> Result<Response> {
        let leader = self.log.leader_id().ok_or(MeshmqError::NoLeaderElected)?;
        let state = self.state.current();
        let node = state
            .get_node(leader)
            .ok_or(MeshmqError::NoLeaderElected)?;

        let mut pooled = self
            .pool
            .get(&node.address, self.barrier_timeout())
            .await
            .map_err(|e| MeshmqError::LeaderDial(e.to_string()))?;
        let response = rpc::call(
            &mut pooled.conn,
            &Envelope {
                leader_only: true,
                request,
            },
        )
        .await?;
        self.pool.put(pooled);
        Ok(response)
    }

    fn expect_index(response: Response) -> Result<u64> {
        match response {
            Response::Ok { index } => Ok(index),
            Response::Error { code, message } => Err(Response::into_error(code, message)),
            other => Err(MeshmqError::Internal(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    fn expect_segment(response: Response) -> Result<SegmentAssignment> {
        match response {
            Response::Segment {
                segment_id,
                primary_node_id,
            } => Ok(SegmentAssignment {
                segment_id,
                primary_node_id,
            }),
            Response::Error { code, message } => Err(Response::into_error(code, message)),
            other => Err(MeshmqError::Internal(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    // ---- namespaces ----

    pub async fn create_namespace(&self, namespace: &str, leader_only: bool) -> Result<u64> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::NamespaceCreate {
                    namespace: namespace.to_string(),
                })
                .await?;
            return Self::expect_index(response);
        }

        if namespace.is_empty() {
            return Err(MeshmqError::Validation(
                "namespace name must not be empty".to_string(),
            ));
        }

        let _tx = self.coordinator.transaction().await;
        let index = self
            .log
            .apply(Command::NamespaceCreate {
                namespace: namespace.to_string(),
            })
            .await?;
        self.log.barrier(self.barrier_timeout()).await?;
        Ok(index)
    }

    pub async fn delete_namespace(self: &Arc<Self>, namespace: &str, leader_only: bool) -> Result<u64> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::NamespaceDelete {
                    namespace: namespace.to_string(),
                })
                .await?;
            return Self::expect_index(response);
        }

        let state = self.state.current();
        if state.find_namespace(namespace).is_none() {
            return Err(MeshmqError::not_found(Entity::Namespace, namespace));
        }

        let _tx = self.coordinator.transaction().await;
        let index = self
            .log
            .apply(Command::NamespaceDelete {
                namespace: namespace.to_string(),
            })
            .await?;
        self.log.barrier(self.barrier_timeout()).await?;
        drop(_tx);
        self.sync_groups();
        Ok(index)
    }

    // ---- topics ----

    pub async fn create_topic(
        &self,
        namespace: &str,
        mut topic: ClusterTopic,
        leader_only: bool,
    ) -> Result<u64> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::TopicCreate {
                    namespace: namespace.to_string(),
                    topic,
                })
                .await?;
            return Self::expect_index(response);
        }

        if namespace.is_empty() || topic.name.is_empty() {
            return Err(MeshmqError::Validation(
                "namespace and topic name must not be empty".to_string(),
            ));
        }
        if topic.replication_factor == 0 {
            topic.replication_factor = DEFAULT_REPLICATION_FACTOR;
        }

        let _tx = self.coordinator.transaction().await;
        let index = self
            .log
            .apply(Command::TopicCreate {
                namespace: namespace.to_string(),
                topic,
            })
            .await?;
        self.log.barrier(self.barrier_timeout()).await?;
        drop(_tx);
        self.reconciler.kick();
        Ok(index)
    }

    pub async fn delete_topic(&self, namespace: &str, name: &str, leader_only: bool) -> Result<u64> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::TopicDelete {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
                .await?;
            return Self::expect_index(response);
        }

        let state = self.state.current();
        if state.get_topic(namespace, name).is_none() {
            return Err(MeshmqError::not_found(
                Entity::Topic,
                format!("{}/{}", namespace, name),
            ));
        }

        let _tx = self.coordinator.transaction().await;
        let index = self
            .log
            .apply(Command::TopicDelete {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .await?;
        self.log.barrier(self.barrier_timeout()).await?;
        Ok(index)
    }

    /// Topics of a namespace, served from the local snapshot.
    pub fn list_topics(&self, namespace: &str) -> Result<Vec<ClusterTopic>> {
        let state = self.state.current();
        let namespace = state
            .find_namespace(namespace)
            .ok_or_else(|| MeshmqError::not_found(Entity::Namespace, namespace))?;
        Ok(namespace.topics.iter().map(|t| (**t).clone()).collect())
    }

    // ---- consumer groups ----

    pub async fn create_consumer_group(
        self: &Arc<Self>,
        namespace: &str,
        mut consumer_group: ClusterConsumerGroup,
        leader_only: bool,
    ) -> Result<u64> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::ConsumerGroupCreate {
                    namespace: namespace.to_string(),
                    consumer_group,
                })
                .await?;
            return Self::expect_index(response);
        }

        if namespace.is_empty() || consumer_group.name.is_empty() {
            return Err(MeshmqError::Validation(
                "namespace and consumer group name must not be empty".to_string(),
            ));
        }

        let _tx = self.coordinator.transaction().await;
        let state = self.state.current();

        for binding in &consumer_group.bindings {
            let topic = state
                .get_topic(namespace, &binding.topic_name)
                .ok_or_else(|| {
                    MeshmqError::not_found(
                        Entity::Topic,
                        format!("{}/{}", namespace, binding.topic_name),
                    )
                })?;
            let compatible = matches!(
                (topic.kind, &binding.by),
                (TopicKind::Direct | TopicKind::Topic, BindingMatch::RoutingKey(_))
                    | (
                        TopicKind::Headers,
                        BindingMatch::HeadersAll(_) | BindingMatch::HeadersAny(_)
                    )
                    | (TopicKind::Fanout, BindingMatch::Fanout)
            );
            if !compatible {
                return Err(MeshmqError::Validation(format!(
                    "binding to topic {}/{} does not match the topic type",
                    namespace, binding.topic_name
                )));
            }
        }

        if consumer_group.size == 0 {
            consumer_group.size = DEFAULT_CONSUMER_GROUP_SIZE;
        }
        if consumer_group.since == 0 {
            consumer_group.since = match state.find_consumer_group(namespace, &consumer_group.name)
            {
                Some(existing) if existing.since != 0 => existing.since,
                _ => now_millis(),
            };
        }

        let index = self
            .log
            .apply(Command::ConsumerGroupCreate {
                namespace: namespace.to_string(),
                consumer_group: consumer_group.clone(),
            })
            .await?;
        self.log.barrier(self.barrier_timeout()).await?;

        // reload after the barrier, then make sure the group has an open
        // offset-commits segment before anyone subscribes
        let state = self.state.current();
        let owner = NamespaceName::new(namespace, &consumer_group.name);
        if state
            .open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner)
            .is_empty()
        {
            if let Some(primary) =
                crate::cluster::segments::SegmentCoordinator::pick_primary(&state)
            {
                self.coordinator
                    .open_locked(
                        &state,
                        primary,
                        &owner,
                        SegmentKind::ConsumerGroupOffsetCommits,
                        Vec::new(),
                    )
                    .await?;
            }
        }
        drop(_tx);

        self.sync_groups();
        self.reconciler.kick();
        Ok(index)
    }

    pub async fn delete_consumer_group(
        self: &Arc<Self>,
        namespace: &str,
        name: &str,
        leader_only: bool,
    ) -> Result<u64> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::ConsumerGroupDelete {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
                .await?;
            return Self::expect_index(response);
        }

        let state = self.state.current();
        if state.find_consumer_group(namespace, name).is_none() {
            return Err(MeshmqError::not_found(
                Entity::ConsumerGroup,
                format!("{}/{}", namespace, name),
            ));
        }

        let _tx = self.coordinator.transaction().await;
        let index = self
            .log
            .apply(Command::ConsumerGroupDelete {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .await?;
        self.log.barrier(self.barrier_timeout()).await?;
        drop(_tx);
        self.sync_groups();
        Ok(index)
    }

    pub async fn update_offset_commits(
        &self,
        namespace: &str,
        name: &str,
        offset_commits: Vec<OffsetCommit>,
        leader_only: bool,
    ) -> Result<u64> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::OffsetCommitsUpdate {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    offset_commits,
                })
                .await?;
            return Self::expect_index(response);
        }

        self.log
            .apply(Command::ConsumerGroupOffsetCommitsUpdate {
                namespace: namespace.to_string(),
                name: name.to_string(),
                offset_commits,
            })
            .await
    }

    /// Poll until the group's in-memory runtime exists on this node (the
    /// primary), forwarding there first when needed.
    pub async fn consumer_group_wait(
        &self,
        namespace: &str,
        name: &str,
        do_not_forward: bool,
    ) -> Result<()> {
        let state = self.state.current();
        if state.find_consumer_group(namespace, name).is_none() {
            return Err(MeshmqError::not_found(
                Entity::ConsumerGroup,
                format!("{}/{}", namespace, name),
            ));
        }

        let owner = NamespaceName::new(namespace, name);
        let segments = state.open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner);
        let segment = segments.first().ok_or_else(|| {
            MeshmqError::PreconditionFailed("consumer group not assigned to any node".to_string())
        })?;

        if segment.nodes.primary_node_id != self.node_id() {
            if do_not_forward {
                return Err(MeshmqError::PreconditionFailed(
                    "consumer group is not primary here".to_string(),
                ));
            }
            let node = state
                .get_node(segment.nodes.primary_node_id)
                .ok_or_else(|| {
                    MeshmqError::not_found(
                        Entity::Node,
                        segment.nodes.primary_node_id.to_string(),
                    )
                })?;
            let mut pooled = self.pool.get(&node.address, self.barrier_timeout()).await?;
            let response = rpc::call(
                &mut pooled.conn,
                &Envelope {
                    leader_only: false,
                    request: Request::ConsumerGroupWait {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    },
                },
            )
            .await?;
            self.pool.put(pooled);
            return Self::expect_index(response).map(|_| ());
        }

        let deadline = tokio::time::Instant::now() + self.barrier_timeout();
        loop {
            if self.find_group(namespace, name).is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MeshmqError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // ---- segments ----

    pub async fn open_segment(
        &self,
        node_id: NodeId,
        owner: NamespaceName,
        kind: SegmentKind,
        first_message_id: Vec<u8>,
        leader_only: bool,
    ) -> Result<SegmentAssignment> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::SegmentOpen {
                    node_id,
                    kind,
                    owner,
                    first_message_id,
                })
                .await?;
            return Self::expect_segment(response);
        }

        self.coordinator
            .open(node_id, owner, kind, first_message_id)
            .await
    }

    pub async fn rotate_segment(
        &self,
        old_segment_id: SegmentId,
        node_id: NodeId,
        size: u64,
        checksum: u32,
        leader_only: bool,
    ) -> Result<SegmentAssignment> {
        if !self.log.is_leader() {
            if leader_only {
                return Err(MeshmqError::NotLeader);
            }
            let response = self
                .forward_to_leader(Request::SegmentRotate {
                    old_segment_id,
                    node_id,
                    size,
                    checksum,
                })
                .await?;
            return Self::expect_segment(response);
        }

        self.coordinator
            .rotate(old_segment_id, node_id, size, checksum)
            .await
    }

    // ---- publish path ----

    /// Publish a message to a topic: pick the append segment for this node,
    /// append (locally or on the segment's primary), and fan out to
    /// matching consumer groups.
    pub async fn publish(
        self: &Arc<Self>,
        namespace: &str,
        topic_name: &str,
        message: Message,
    ) -> Result<()> {
        let state = self.state.current();
        if state.get_topic(namespace, topic_name).is_none() {
            return Err(MeshmqError::not_found(
                Entity::Topic,
                format!("{}/{}", namespace, topic_name),
            ));
        }

        let owner = NamespaceName::new(namespace, topic_name);
        let first_message_id = message
            .message_id
            .as_ref()
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default();
        let assignment = self
            .open_segment(
                self.node_id(),
                owner,
                SegmentKind::Topic,
                first_message_id,
                false,
            )
            .await?;

        if assignment.primary_node_id == self.node_id() {
            return self
                .publish_local(namespace, topic_name, message, assignment.segment_id)
                .await;
        }

        // the topic's shard cap put this publish on another node's segment
        let node = state
            .get_node(assignment.primary_node_id)
            .ok_or_else(|| {
                MeshmqError::not_found(Entity::Node, assignment.primary_node_id.to_string())
            })?;
        let mut pooled = self.pool.get(&node.address, self.barrier_timeout()).await?;
        let response = rpc::call(
            &mut pooled.conn,
            &Envelope {
                leader_only: false,
                request: Request::Publish {
                    namespace: namespace.to_string(),
                    topic: topic_name.to_string(),
                    message,
                    segment_id: assignment.segment_id,
                },
            },
        )
        .await?;
        self.pool.put(pooled);
        Self::expect_index(response).map(|_| ())
    }

    /// Append to a segment this node is primary for, then fan out.
    pub async fn publish_local(
        self: &Arc<Self>,
        namespace: &str,
        topic_name: &str,
        message: Message,
        segment_id: SegmentId,
    ) -> Result<()> {
        let state = self.state.current();
        let segment = state
            .get_open_segment(segment_id)
            .ok_or_else(|| MeshmqError::not_found(Entity::Segment, segment_id.to_string()))?;
        if segment.nodes.primary_node_id != self.node_id() {
            return Err(MeshmqError::PreconditionFailed(format!(
                "node {} is not primary for segment {}",
                self.node_id(),
                segment_id
            )));
        }

        let payload = bincode::serialize(&message)?;
        let offset = self.storage.append(segment_id, &payload)?;
        debug!(
            "appended message to segment {} at offset {}",
            segment_id, offset
        );

        if self.storage.is_full(segment_id) {
            let (size, checksum) = self.storage.close(segment_id)?;
            if let Err(e) = self
                .rotate_segment(segment_id, self.node_id(), size, checksum, false)
                .await
            {
                warn!("segment {} rotation failed: {}", segment_id, e);
            }
        }

        self.fan_out(namespace, topic_name, message, segment_id, offset)
            .await
    }

    /// Route an appended message into every matching consumer group.
    async fn fan_out(
        self: &Arc<Self>,
        namespace_name: &str,
        topic_name: &str,
        message: Message,
        segment_id: SegmentId,
        offset: u64,
    ) -> Result<()> {
        let state = self.state.current();
        let Some(namespace) = state.find_namespace(namespace_name) else {
            return Ok(());
        };
        let Some(topic) = namespace.find_topic(topic_name) else {
            return Ok(());
        };

        for group in &namespace.consumer_groups {
            if !message_matches(&message, message.timestamp, topic, group) {
                continue;
            }

            let owner = NamespaceName::new(namespace_name, &group.name);
            let segments =
                state.open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner);
            let Some(segment) = segments.first() else {
                debug!("group {} has no offset segment yet, skipping", owner);
                continue;
            };

            if segment.nodes.primary_node_id == self.node_id() {
                self.deliver_to_group(
                    namespace_name,
                    &group.name,
                    topic_name.to_string(),
                    message.clone(),
                    segment_id,
                    offset,
                )
                .await?;
            } else if let Some(node) = state.get_node(segment.nodes.primary_node_id) {
                let mut pooled = self.pool.get(&node.address, self.barrier_timeout()).await?;
                let response = rpc::call(
                    &mut pooled.conn,
                    &Envelope {
                        leader_only: false,
                        request: Request::GroupDeliver {
                            namespace: namespace_name.to_string(),
                            name: group.name.clone(),
                            topic: topic_name.to_string(),
                            message: message.clone(),
                            segment_id,
                            offset,
                        },
                    },
                )
                .await?;
                self.pool.put(pooled);
                Self::expect_index(response)?;
            }
        }
        Ok(())
    }

    /// Enqueue into the local group runtime.
    pub async fn deliver_to_group(
        &self,
        namespace: &str,
        name: &str,
        topic: String,
        message: Message,
        segment_id: SegmentId,
        offset: u64,
    ) -> Result<()> {
        let Some(group) = self.find_group(namespace, name) else {
            debug!("group {}/{} runtime not running here", namespace, name);
            return Ok(());
        };
        group.publish(topic, message, segment_id, offset).await
    }

    // ---- subscribe / ack path ----

    /// Subscribe to a consumer group, forwarding to the node that runs the
    /// group when it is not this one.
    pub async fn subscribe(
        self: &Arc<Self>,
        namespace: &str,
        name: &str,
        credit: u32,
        do_not_forward: bool,
    ) -> Result<SubscriberStream> {
        let state = self.state.current();
        if state.find_namespace(namespace).is_none() {
            return Err(MeshmqError::not_found(Entity::Namespace, namespace));
        }
        if state.find_consumer_group(namespace, name).is_none() {
            return Err(MeshmqError::not_found(
                Entity::ConsumerGroup,
                format!("{}/{}", namespace, name),
            ));
        }

        let owner = NamespaceName::new(namespace, name);
        let segments = state.open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner);
        let segment = segments.first().ok_or_else(|| {
            MeshmqError::PreconditionFailed("consumer group not assigned to any node".to_string())
        })?;
        if segments.len() > 1 {
            return Err(MeshmqError::Internal(
                "consumer group assigned to multiple nodes".to_string(),
            ));
        }

        if segment.nodes.primary_node_id != self.node_id() {
            if do_not_forward {
                return Err(MeshmqError::PreconditionFailed(
                    "refusing to forward subscription twice".to_string(),
                ));
            }
            let node = state
                .get_node(segment.nodes.primary_node_id)
                .ok_or_else(|| {
                    MeshmqError::not_found(
                        Entity::Node,
                        segment.nodes.primary_node_id.to_string(),
                    )
                })?;

            // subscriptions hold their connection for their whole life,
            // so they bypass the pool
            let stream = tokio::time::timeout(
                Duration::from_secs(5),
                TcpStream::connect(node.address.as_str()),
            )
            .await
            .map_err(|_| MeshmqError::Timeout)??;
            let mut conn = rpc::connect_framed(stream);
            let envelope = Envelope {
                leader_only: false,
                request: Request::Subscribe {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    credit,
                    do_not_forward: true,
                },
            };
            use futures::SinkExt;
            let frame = bincode::serialize(&envelope)?;
            conn.send(bytes::Bytes::from(frame)).await?;
            return Ok(SubscriberStream::Remote { conn });
        }

        self.consumer_group_wait(namespace, name, true).await?;
        let group = self.find_group(namespace, name).ok_or_else(|| {
            MeshmqError::PreconditionFailed(format!(
                "consumer group {}/{} is not running",
                namespace, name
            ))
        })?;

        let subscription = group.subscribe(credit);
        self.subscriptions
            .insert(subscription.id(), Arc::clone(&group));
        Ok(SubscriberStream::Local {
            subscription,
            node_id: self.node_id(),
            broker: Arc::clone(self),
        })
    }

    /// Acknowledge a delivery, routing to the node named in it.
    pub async fn ack(
        &self,
        node_id: NodeId,
        subscription_id: SubscriptionId,
        seq_no: SeqNo,
    ) -> Result<()> {
        if node_id == self.node_id() {
            return self.ack_local(subscription_id, seq_no);
        }
        self.remote_ack(
            node_id,
            Request::Ack {
                subscription_id,
                seq_no,
            },
        )
        .await
    }

    pub async fn nack(
        &self,
        node_id: NodeId,
        subscription_id: SubscriptionId,
        seq_no: SeqNo,
        requeue: bool,
    ) -> Result<()> {
        if node_id == self.node_id() {
            return self.nack_local(subscription_id, seq_no, requeue);
        }
        self.remote_ack(
            node_id,
            Request::Nack {
                subscription_id,
                seq_no,
                requeue,
            },
        )
        .await
    }

    async fn remote_ack(&self, node_id: NodeId, request: Request) -> Result<()> {
        let state = self.state.current();
        let node = state
            .get_node(node_id)
            .ok_or_else(|| MeshmqError::not_found(Entity::Node, node_id.to_string()))?;
        let mut pooled = self.pool.get(&node.address, self.barrier_timeout()).await?;
        let response = rpc::call(
            &mut pooled.conn,
            &Envelope {
                leader_only: false,
                request,
            },
        )
        .await?;
        self.pool.put(pooled);
        Self::expect_index(response).map(|_| ())
    }

    /// Acks for unknown subscriptions are no-ops: the group may already be
    /// deleted or the subscription closed.
    pub fn ack_local(&self, subscription_id: SubscriptionId, seq_no: SeqNo) -> Result<()> {
        if let Some(group) = self.subscriptions.get(&subscription_id) {
            group.ack(subscription_id, seq_no)?;
        }
        Ok(())
    }

    pub fn nack_local(
        &self,
        subscription_id: SubscriptionId,
        seq_no: SeqNo,
        requeue: bool,
    ) -> Result<()> {
        if let Some(group) = self.subscriptions.get(&subscription_id) {
            group.nack(subscription_id, seq_no, requeue)?;
        }
        Ok(())
    }

    /// Build a wire delivery for sessions that subscribe through the local
    /// runtime but track acknowledgement by (node, subscription, seq-no).
    pub fn wire_delivery(
        &self,
        subscription_id: SubscriptionId,
        delivery: crate::consumers::Delivery,
    ) -> WireDelivery {
        WireDelivery {
            topic: delivery.topic,
            message: delivery.message,
            node_id: self.node_id(),
            subscription_id,
            seq_no: delivery.seq_no,
        }
    }
}
