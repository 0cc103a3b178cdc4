//! Node-to-node RPC.
//!
//! Peers exchange bincode-encoded envelopes over a length-delimited TCP
//! transport. Every leader-only request carries a `leader_only` flag: a node
//! that receives a flagged request while not leader answers `NotLeader`
//! instead of forwarding again, which breaks forwarding loops.

use super::Broker;
use crate::cluster::{
    ClusterConsumerGroup, ClusterTopic, NodeId, OffsetCommit, SegmentId, SegmentKind,
};
use crate::consumers::{SeqNo, SubscriptionId};
use crate::protocol::{Message, NamespaceName};
use crate::{Entity, MeshmqError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

pub type RpcConn = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub leader_only: bool,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
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
    TopicList {
        namespace: String,
    },
    ConsumerGroupCreate {
        namespace: String,
        consumer_group: ClusterConsumerGroup,
    },
    ConsumerGroupDelete {
        namespace: String,
        name: String,
    },
    ConsumerGroupWait {
        namespace: String,
        name: String,
    },
    OffsetCommitsUpdate {
        namespace: String,
        name: String,
        offset_commits: Vec<OffsetCommit>,
    },
    SegmentOpen {
        node_id: NodeId,
        kind: SegmentKind,
        owner: NamespaceName,
        first_message_id: Vec<u8>,
    },
    SegmentRotate {
        old_segment_id: SegmentId,
        node_id: NodeId,
        size: u64,
        checksum: u32,
    },
    /// Append a published message on the node that is primary for
    /// `segment_id`.
    Publish {
        namespace: String,
        topic: String,
        message: Message,
        segment_id: SegmentId,
    },
    /// Hand a routed message to the consumer-group runtime on its primary.
    GroupDeliver {
        namespace: String,
        name: String,
        topic: String,
        message: Message,
        segment_id: SegmentId,
        offset: u64,
    },
    Ack {
        subscription_id: SubscriptionId,
        seq_no: SeqNo,
    },
    Nack {
        subscription_id: SubscriptionId,
        seq_no: SeqNo,
        requeue: bool,
    },
    /// Turns the connection into a delivery stream until either side drops.
    Subscribe {
        namespace: String,
        name: String,
        credit: u32,
        do_not_forward: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok {
        index: u64,
    },
    Topics {
        topics: Vec<ClusterTopic>,
    },
    Segment {
        segment_id: SegmentId,
        primary_node_id: NodeId,
    },
    Delivery(WireDelivery),
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// One delivery as it crosses node or session boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDelivery {
    pub topic: String,
    pub message: Message,
    pub node_id: NodeId,
    pub subscription_id: SubscriptionId,
    pub seq_no: SeqNo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotLeader,
    NoLeaderElected,
    LeaderDial,
    Validation,
    NotFound,
    PreconditionFailed,
    NotImplemented,
    SubscriptionClosed,
    Shutdown,
    Timeout,
    Internal,
}

impl Response {
    pub fn from_error(err: &MeshmqError) -> Self {
        let code = match err {
            MeshmqError::NotLeader => ErrorCode::NotLeader,
            MeshmqError::NoLeaderElected => ErrorCode::NoLeaderElected,
            MeshmqError::LeaderDial(_) => ErrorCode::LeaderDial,
            MeshmqError::Validation(_) => ErrorCode::Validation,
            MeshmqError::NotFound { .. } => ErrorCode::NotFound,
            MeshmqError::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            MeshmqError::NotImplemented(_) => ErrorCode::NotImplemented,
            MeshmqError::SubscriptionClosed => ErrorCode::SubscriptionClosed,
            MeshmqError::Shutdown => ErrorCode::Shutdown,
            MeshmqError::Timeout => ErrorCode::Timeout,
            _ => ErrorCode::Internal,
        };
        Response::Error {
            code,
            message: err.to_string(),
        }
    }

    /// Map a wire error back into the caller's error space.
    pub fn into_error(code: ErrorCode, message: String) -> MeshmqError {
        match code {
            ErrorCode::NotLeader => MeshmqError::NotLeader,
            ErrorCode::NoLeaderElected => MeshmqError::NoLeaderElected,
            ErrorCode::LeaderDial => MeshmqError::LeaderDial(message),
            ErrorCode::Validation => MeshmqError::Validation(message),
            ErrorCode::NotFound => MeshmqError::NotFound {
                entity: Entity::Topic,
                name: message,
            },
            ErrorCode::PreconditionFailed => MeshmqError::PreconditionFailed(message),
            ErrorCode::NotImplemented => MeshmqError::NotImplemented(message),
            ErrorCode::SubscriptionClosed => MeshmqError::SubscriptionClosed,
            ErrorCode::Shutdown => MeshmqError::Shutdown,
            ErrorCode::Timeout => MeshmqError::Timeout,
            ErrorCode::Internal => MeshmqError::Internal(message),
        }
    }
}

pub fn connect_framed(stream: TcpStream) -> RpcConn {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Send one envelope and await the single response frame.
pub async fn call(conn: &mut RpcConn, envelope: &Envelope) -> Result<Response> {
    let frame = bincode::serialize(envelope)?;
    conn.send(Bytes::from(frame)).await?;
    match conn.next().await {
        Some(Ok(frame)) => Ok(bincode::deserialize(&frame)?),
        Some(Err(e)) => Err(e.into()),
        None => Err(MeshmqError::Internal("peer closed connection".to_string())),
    }
}

/// Accept loop for the node RPC listener.
pub async fn serve(broker: Arc<Broker>, listener: TcpListener) {
    info!(
        "node rpc listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    );
    let mut shutdown = broker.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("rpc connection from {}", addr);
                    let broker = Arc::clone(&broker);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(broker, stream).await {
                            debug!("rpc connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("rpc accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_connection(broker: Arc<Broker>, stream: TcpStream) -> Result<()> {
    let mut conn = connect_framed(stream);

    while let Some(frame) = conn.next().await {
        let frame = frame?;
        let envelope: Envelope = match bincode::deserialize(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("undecodable rpc frame: {}", e);
                return Ok(());
            }
        };

        // subscribe switches the connection into streaming mode
        if let Request::Subscribe {
            namespace,
            name,
            credit,
            do_not_forward,
        } = envelope.request
        {
            return stream_subscription(broker, conn, namespace, name, credit, do_not_forward)
                .await;
        }

        let response = dispatch(&broker, envelope).await;
        let frame = bincode::serialize(&response)?;
        conn.send(Bytes::from(frame)).await?;
    }
    Ok(())
}

async fn dispatch(broker: &Arc<Broker>, envelope: Envelope) -> Response {
    let leader_only = envelope.leader_only;
    let result = match envelope.request {
        Request::NamespaceCreate { namespace } => broker
            .create_namespace(&namespace, leader_only)
            .await
            .map(|index| Response::Ok { index }),
        Request::NamespaceDelete { namespace } => broker
            .delete_namespace(&namespace, leader_only)
            .await
            .map(|index| Response::Ok { index }),
        Request::TopicCreate { namespace, topic } => broker
            .create_topic(&namespace, topic, leader_only)
            .await
            .map(|index| Response::Ok { index }),
        Request::TopicDelete { namespace, name } => broker
            .delete_topic(&namespace, &name, leader_only)
            .await
            .map(|index| Response::Ok { index }),
        Request::TopicList { namespace } => broker
            .list_topics(&namespace)
            .map(|topics| Response::Topics { topics }),
        Request::ConsumerGroupCreate {
            namespace,
            consumer_group,
        } => broker
            .create_consumer_group(&namespace, consumer_group, leader_only)
            .await
            .map(|index| Response::Ok { index }),
        Request::ConsumerGroupDelete { namespace, name } => broker
            .delete_consumer_group(&namespace, &name, leader_only)
            .await
            .map(|index| Response::Ok { index }),
        Request::ConsumerGroupWait { namespace, name } => broker
            .consumer_group_wait(&namespace, &name, true)
            .await
            .map(|_| Response::Ok { index: 0 }),
        Request::OffsetCommitsUpdate {
            namespace,
            name,
            offset_commits,
        } => broker
            .update_offset_commits(&namespace, &name, offset_commits, leader_only)
            .await
            .map(|index| Response::Ok { index }),
        Request::SegmentOpen {
            node_id,
            kind,
            owner,
            first_message_id,
        } => broker
            .open_segment(node_id, owner, kind, first_message_id, leader_only)
            .await
            .map(|a| Response::Segment {
                segment_id: a.segment_id,
                primary_node_id: a.primary_node_id,
            }),
        Request::SegmentRotate {
            old_segment_id,
            node_id,
            size,
            checksum,
        } => broker
            .rotate_segment(old_segment_id, node_id, size, checksum, leader_only)
            .await
            .map(|a| Response::Segment {
                segment_id: a.segment_id,
                primary_node_id: a.primary_node_id,
            }),
        Request::Publish {
            namespace,
            topic,
            message,
            segment_id,
        } => broker
            .publish_local(&namespace, &topic, message, segment_id)
            .await
            .map(|_| Response::Ok { index: 0 }),
        Request::GroupDeliver {
            namespace,
            name,
            topic,
            message,
            segment_id,
            offset,
        } => broker
            .deliver_to_group(&namespace, &name, topic, message, segment_id, offset)
            .await
            .map(|_| Response::Ok { index: 0 }),
        Request::Ack {
            subscription_id,
            seq_no,
        } => broker
            .ack_local(subscription_id, seq_no)
            .map(|_| Response::Ok { index: 0 }),
        Request::Nack {
            subscription_id,
            seq_no,
            requeue,
        } => broker
            .nack_local(subscription_id, seq_no, requeue)
            .map(|_| Response::Ok { index: 0 }),
        Request::Subscribe { .. } => unreachable!("handled by serve_connection"),
    };

    match result {
        Ok(response) => response,
        Err(e) => Response::from_error(&e),
    }
}

async fn stream_subscription(
    broker: Arc<Broker>,
    mut conn: RpcConn,
    namespace: String,
    name: String,
    credit: u32,
    do_not_forward: bool,
) -> Result<()> {
    let mut stream = match broker
        .subscribe(&namespace, &name, credit, do_not_forward)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            let frame = bincode::serialize(&Response::from_error(&e))?;
            conn.send(Bytes::from(frame)).await?;
            return Ok(());
        }
    };

    loop {
        tokio::select! {
            delivery = stream.next() => {
                let response = match delivery {
                    Ok(delivery) => Response::Delivery(delivery),
                    Err(e) => {
                        let frame = bincode::serialize(&Response::from_error(&e))?;
                        conn.send(Bytes::from(frame)).await?;
                        return Ok(());
                    }
                };
                let frame = bincode::serialize(&response)?;
                conn.send(Bytes::from(frame)).await?;
            }
            // the forwarding side acks through its own Ack requests; any
            // inbound frame here means the peer went away
            closed = conn.next() => {
                if closed.is_none() {
                    return Ok(());
                }
            }
        }
    }
}
