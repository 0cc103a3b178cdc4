//! AMQP 0-9-1 wire protocol.
//!
//! Frame layout: `{type: u8, channel: u16, size: u32}` header, `size` bytes
//! of payload, and the 0xCE end marker. Method payloads carry class id,
//! method id, and the method's arguments; content flows as a header frame
//! followed by body frames.

pub mod codec;

use super::{FieldTable, FieldValue};
use bytes::Bytes;

pub use codec::{Amqp0Codec, Amqp0CodecError};

/// Protocol negotiation preamble sent by clients before any frame.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xCE;

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_QUEUE: u16 = 50;
pub const CLASS_BASIC: u16 = 60;

// reply codes
pub const REPLY_SUCCESS: u16 = 200;
pub const CONTENT_TOO_LARGE: u16 = 311;
pub const NO_ROUTE: u16 = 312;
pub const NO_CONSUMERS: u16 = 313;
pub const CONNECTION_FORCED: u16 = 320;
pub const INVALID_PATH: u16 = 402;
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const RESOURCE_LOCKED: u16 = 405;
pub const PRECONDITION_FAILED: u16 = 406;
pub const FRAME_ERROR: u16 = 501;
pub const SYNTAX_ERROR: u16 = 502;
pub const COMMAND_INVALID: u16 = 503;
pub const CHANNEL_ERROR: u16 = 504;
pub const UNEXPECTED_FRAME: u16 = 505;
pub const RESOURCE_ERROR: u16 = 506;
pub const NOT_ALLOWED: u16 = 530;
pub const NOT_IMPLEMENTED: u16 = 540;
pub const INTERNAL_ERROR: u16 = 541;

/// One parsed 0-9-1 frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Method { channel: u16, method: Method },
    ContentHeader { channel: u16, header: ContentHeader },
    ContentBody { channel: u16, payload: Bytes },
    Heartbeat { channel: u16 },
}

impl Frame {
    pub fn channel(&self) -> u16 {
        match self {
            Frame::Method { channel, .. }
            | Frame::ContentHeader { channel, .. }
            | Frame::ContentBody { channel, .. }
            | Frame::Heartbeat { channel } => *channel,
        }
    }
}

/// Content header frame payload: class id, total body size, and the basic
/// properties list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

/// Basic-class content properties. Presence is driven by the property flag
/// word on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// Every method frame the broker sends or receives, one variant per
/// (class, method) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,

    ChannelOpen,
    ChannelOpenOk,
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,

    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
}

impl Method {
    /// (class id, method id) of this method on the wire.
    pub fn ids(&self) -> (u16, u16) {
        use Method::*;
        match self {
            ConnectionStart { .. } => (CLASS_CONNECTION, 10),
            ConnectionStartOk { .. } => (CLASS_CONNECTION, 11),
            ConnectionTune { .. } => (CLASS_CONNECTION, 30),
            ConnectionTuneOk { .. } => (CLASS_CONNECTION, 31),
            ConnectionOpen { .. } => (CLASS_CONNECTION, 40),
            ConnectionOpenOk => (CLASS_CONNECTION, 41),
            ConnectionClose { .. } => (CLASS_CONNECTION, 50),
            ConnectionCloseOk => (CLASS_CONNECTION, 51),
            ChannelOpen => (CLASS_CHANNEL, 10),
            ChannelOpenOk => (CLASS_CHANNEL, 11),
            ChannelClose { .. } => (CLASS_CHANNEL, 40),
            ChannelCloseOk => (CLASS_CHANNEL, 41),
            ExchangeDeclare { .. } => (CLASS_EXCHANGE, 10),
            ExchangeDeclareOk => (CLASS_EXCHANGE, 11),
            ExchangeDelete { .. } => (CLASS_EXCHANGE, 20),
            ExchangeDeleteOk => (CLASS_EXCHANGE, 21),
            QueueDeclare { .. } => (CLASS_QUEUE, 10),
            QueueDeclareOk { .. } => (CLASS_QUEUE, 11),
            QueueBind { .. } => (CLASS_QUEUE, 20),
            QueueBindOk => (CLASS_QUEUE, 21),
            QueueDelete { .. } => (CLASS_QUEUE, 40),
            QueueDeleteOk { .. } => (CLASS_QUEUE, 41),
            QueueUnbind { .. } => (CLASS_QUEUE, 50),
            QueueUnbindOk => (CLASS_QUEUE, 51),
            BasicQos { .. } => (CLASS_BASIC, 10),
            BasicQosOk => (CLASS_BASIC, 11),
            BasicConsume { .. } => (CLASS_BASIC, 20),
            BasicConsumeOk { .. } => (CLASS_BASIC, 21),
            BasicCancel { .. } => (CLASS_BASIC, 30),
            BasicCancelOk { .. } => (CLASS_BASIC, 31),
            BasicPublish { .. } => (CLASS_BASIC, 40),
            BasicDeliver { .. } => (CLASS_BASIC, 60),
            BasicAck { .. } => (CLASS_BASIC, 80),
            BasicReject { .. } => (CLASS_BASIC, 90),
            BasicNack { .. } => (CLASS_BASIC, 120),
        }
    }
}

/// Convenience accessors for declare arguments used by the broker
/// (`shards`, `replication-factor`, `retention` on exchanges, `size` on
/// queues).
pub fn table_u32(arguments: &FieldTable, name: &str, default: u32) -> Result<u32, String> {
    match arguments.get(name) {
        None => Ok(default),
        Some(FieldValue::I8(v)) if *v >= 0 => Ok(*v as u32),
        Some(FieldValue::I16(v)) if *v >= 0 => Ok(*v as u32),
        Some(FieldValue::I32(v)) if *v >= 0 => Ok(*v as u32),
        Some(FieldValue::I64(v)) if *v >= 0 && *v <= u32::MAX as i64 => Ok(*v as u32),
        Some(other) => Err(format!("field {:?} is not a u32: {:?}", name, other)),
    }
}

pub fn table_u64(arguments: &FieldTable, name: &str, default: u64) -> Result<u64, String> {
    match arguments.get(name) {
        None => Ok(default),
        Some(FieldValue::I8(v)) if *v >= 0 => Ok(*v as u64),
        Some(FieldValue::I16(v)) if *v >= 0 => Ok(*v as u64),
        Some(FieldValue::I32(v)) if *v >= 0 => Ok(*v as u64),
        Some(FieldValue::I64(v)) if *v >= 0 => Ok(*v as u64),
        Some(FieldValue::Timestamp(v)) => Ok(*v),
        Some(other) => Err(format!("field {:?} is not a u64: {:?}", name, other)),
    }
}
