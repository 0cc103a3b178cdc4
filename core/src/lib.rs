//! # MeshMQ Core Library
//!
//! MeshMQ is a clustered, AMQP-compatible message broker written in Rust.
//! Messages published to topics (exchanges) are routed into consumer groups
//! (queues) through binding rules, stored in append-only segments coordinated
//! through a replicated catalog, and streamed to subscribers with
//! at-least-once delivery and explicit acknowledgement.
//!
//! ## Architecture Overview
//!
//! - [`broker`] - TCP server, AMQP session handlers, node RPC and forwarding
//! - [`cluster`] - Replicated cluster state machine and segment coordination
//! - [`consumers`] - In-memory consumer-group delivery runtime
//! - [`protocol`] - AMQP 0-9-1 and 1.0 wire codecs, SASL
//! - [`routing`] - Binding and routing-key pattern matching
//! - [`storage`] - Local append-only segment files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshmq::{Broker, BrokerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         port: 5672,
//!         node_id: 1,
//!         ..Default::default()
//!     };
//!
//!     let broker = Arc::new(Broker::new(config)?);
//!     broker.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cluster;
pub mod config;
pub mod consumers;
pub mod protocol;
pub mod routing;
pub mod storage;

pub use broker::Broker;
pub use cluster::store::ClusterStateStore;
pub use cluster::{ClusterState, NodeId, SegmentId};
pub use config::BrokerConfig;
pub use consumers::{ConsumerGroup, Subscription};
pub use protocol::{Message, NamespaceName};

use thiserror::Error;

/// Entity tags carried by [`MeshmqError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Namespace,
    Topic,
    ConsumerGroup,
    Segment,
    Node,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Entity::Namespace => "namespace",
            Entity::Topic => "topic",
            Entity::ConsumerGroup => "consumer group",
            Entity::Segment => "segment",
            Entity::Node => "node",
        };
        f.write_str(s)
    }
}

/// MeshMQ error types
///
/// Semantic error kinds surfaced by broker operations. Protocol sessions map
/// these onto wire-level reply codes; node RPC carries them as code + message.
#[derive(Debug, Error)]
pub enum MeshmqError {
    /// The operation is leader-only and this node is not the leader.
    #[error("not a leader")]
    NotLeader,

    /// The operation is leader-only and no leader is currently elected.
    #[error("no leader elected")]
    NoLeaderElected,

    /// Forwarding to the current leader failed at the transport level.
    #[error("could not dial leader: {0}")]
    LeaderDial(String),

    /// Request validation failures, surfaced to the caller verbatim.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A named entity does not exist.
    #[error("{entity} {name:?} not found")]
    NotFound { entity: Entity, name: String },

    /// A stateful precondition does not hold, e.g. an unknown delivery tag.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Frame-level protocol violations; close the enclosing scope.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame size over limit")]
    FrameTooBig,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    /// The subscription was closed while a `next` call was blocked on it.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// The broker is shutting down; outstanding operations are cancelled.
    #[error("shutdown")]
    Shutdown,

    #[error("operation timed out")]
    Timeout,

    /// Programming errors and broken internal invariants, fatal for their scope.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// AMQP 0-9-1 wire codec errors
    #[error("amqp 0-9-1 codec error: {0}")]
    Amqp0Codec(#[from] protocol::amqp0::Amqp0CodecError),

    /// AMQP 1.0 wire codec errors
    #[error("amqp 1.0 codec error: {0}")]
    Amqp1Codec(#[from] protocol::amqp1::Amqp1CodecError),
}

impl MeshmqError {
    pub fn not_found(entity: Entity, name: impl Into<String>) -> Self {
        MeshmqError::NotFound {
            entity,
            name: name.into(),
        }
    }
}

/// Result type alias used throughout the MeshMQ codebase.
pub type Result<T> = std::result::Result<T, MeshmqError>;
