//! AMQP 1.0 wire protocol.
//!
//! Frames are 8-byte headers `{size: u32, doff: u8, type: u8, channel: u16}`
//! followed by a descriptor-encoded composite (the performative) and an
//! optional payload. Composite kinds are identified by a 64-bit descriptor
//! code; the closed [`Performative`] sum covers every kind the broker
//! handles, and unknown descriptors are malformed frames.

pub mod codec;

use crate::protocol::{FieldValue, Message};
use bytes::Bytes;

pub use codec::{Amqp1Codec, Amqp1CodecError};

/// Smallest max-frame-size a peer may negotiate.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

pub const FRAME_TYPE_AMQP: u8 = 0x00;
pub const FRAME_TYPE_SASL: u8 = 0x01;

pub const PROTO_HEADER_AMQP: [u8; 8] = *b"AMQP\x00\x01\x00\x00";
pub const PROTO_HEADER_SASL: [u8; 8] = *b"AMQP\x03\x01\x00\x00";

// performative descriptors
pub const DESC_OPEN: u64 = 0x10;
pub const DESC_BEGIN: u64 = 0x11;
pub const DESC_ATTACH: u64 = 0x12;
pub const DESC_FLOW: u64 = 0x13;
pub const DESC_TRANSFER: u64 = 0x14;
pub const DESC_DISPOSITION: u64 = 0x15;
pub const DESC_DETACH: u64 = 0x16;
pub const DESC_END: u64 = 0x17;
pub const DESC_CLOSE: u64 = 0x18;
pub const DESC_ERROR: u64 = 0x1d;

// delivery states
pub const DESC_ACCEPTED: u64 = 0x24;
pub const DESC_REJECTED: u64 = 0x25;
pub const DESC_RELEASED: u64 = 0x26;
pub const DESC_MODIFIED: u64 = 0x27;

pub const DESC_SOURCE: u64 = 0x28;
pub const DESC_TARGET: u64 = 0x29;

// sasl frames
pub const DESC_SASL_MECHANISMS: u64 = 0x40;
pub const DESC_SASL_INIT: u64 = 0x41;
pub const DESC_SASL_CHALLENGE: u64 = 0x42;
pub const DESC_SASL_RESPONSE: u64 = 0x43;
pub const DESC_SASL_OUTCOME: u64 = 0x44;

// bare message sections
pub const DESC_MSG_PROPERTIES: u64 = 0x73;
pub const DESC_MSG_APP_PROPERTIES: u64 = 0x74;
pub const DESC_MSG_DATA: u64 = 0x75;

/// Decoded AMQP 1.0 primitive value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Int(i32),
    Long(i64),
    Timestamp(i64),
    String(String),
    Symbol(String),
    Binary(Bytes),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Described(u64, Box<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Ubyte(v) => Some(*v as u32),
            Value::Ushort(v) => Some(*v as u32),
            Value::Int(v) if *v >= 0 => Some(*v as u32),
            Value::Ulong(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Ulong(v) => Some(*v),
            _ => self.as_u32().map(u64::from),
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|v| u16::try_from(v).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// List-position accessor used when mapping composites to structs; absent
/// and null positions read the same.
fn field(list: &[Value], index: usize) -> &Value {
    list.get(index).unwrap_or(&Value::Null)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Amqp,
    Sasl,
}

/// One decoded 1.0 frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    ProtocolHeader(ProtocolId),
    /// Empty frame body; acts as a heartbeat.
    Empty {
        channel: u16,
    },
    Amqp {
        channel: u16,
        performative: Performative,
        /// Message bytes riding behind a transfer performative.
        payload: Bytes,
    },
    Sasl(SaslFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaslFrame {
    Mechanisms {
        mechanisms: Vec<String>,
    },
    Init {
        mechanism: String,
        initial_response: Bytes,
    },
    Outcome {
        code: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: Option<u32>,
    pub channel_max: Option<u16>,
    /// Milliseconds. Absent means the peer never goes idle.
    pub idle_timeout: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Option<u32>,
}

/// Link role on the wire: false = sender, true = receiver.
pub type Role = bool;
pub const ROLE_SENDER: Role = false;
pub const ROLE_RECEIVER: Role = true;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub source_address: Option<String>,
    pub target_address: Option<String>,
    pub initial_delivery_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
    pub drain: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Accepted,
    Rejected(Option<AmqpError>),
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detach {
    pub handle: u32,
    pub closed: bool,
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct End {
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Close {
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AmqpError {
    pub condition: String,
    pub description: Option<String>,
}

impl AmqpError {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
        }
    }

    pub fn with_description(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Described(DESC_ERROR, body) => {
                let Value::List(list) = body.as_ref() else {
                    return None;
                };
                Some(Self {
                    condition: field(list, 0).as_str().unwrap_or_default().to_string(),
                    description: field(list, 1).as_str().map(str::to_string),
                })
            }
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        Value::Described(
            DESC_ERROR,
            Box::new(Value::List(vec![
                Value::Symbol(self.condition.clone()),
                match &self.description {
                    Some(d) => Value::String(d.clone()),
                    None => Value::Null,
                },
            ])),
        )
    }
}

impl DeliveryState {
    pub fn from_value(value: &Value) -> Option<Self> {
        let Value::Described(descriptor, body) = value else {
            return None;
        };
        let list = match body.as_ref() {
            Value::List(list) => list.as_slice(),
            _ => &[],
        };
        match *descriptor {
            DESC_ACCEPTED => Some(DeliveryState::Accepted),
            DESC_REJECTED => Some(DeliveryState::Rejected(AmqpError::from_value(field(
                list, 0,
            )))),
            DESC_RELEASED => Some(DeliveryState::Released),
            DESC_MODIFIED => Some(DeliveryState::Modified {
                delivery_failed: field(list, 0).as_bool().unwrap_or(false),
                undeliverable_here: field(list, 1).as_bool().unwrap_or(false),
            }),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DeliveryState::Accepted => {
                Value::Described(DESC_ACCEPTED, Box::new(Value::List(Vec::new())))
            }
            DeliveryState::Rejected(error) => Value::Described(
                DESC_REJECTED,
                Box::new(Value::List(vec![match error {
                    Some(e) => e.to_value(),
                    None => Value::Null,
                }])),
            ),
            DeliveryState::Released => {
                Value::Described(DESC_RELEASED, Box::new(Value::List(Vec::new())))
            }
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
            } => Value::Described(
                DESC_MODIFIED,
                Box::new(Value::List(vec![
                    Value::Bool(*delivery_failed),
                    Value::Bool(*undeliverable_here),
                ])),
            ),
        }
    }
}

// ---- performative <-> value mapping ----

impl Performative {
    pub fn descriptor(&self) -> u64 {
        match self {
            Performative::Open(_) => DESC_OPEN,
            Performative::Begin(_) => DESC_BEGIN,
            Performative::Attach(_) => DESC_ATTACH,
            Performative::Flow(_) => DESC_FLOW,
            Performative::Transfer(_) => DESC_TRANSFER,
            Performative::Disposition(_) => DESC_DISPOSITION,
            Performative::Detach(_) => DESC_DETACH,
            Performative::End(_) => DESC_END,
            Performative::Close(_) => DESC_CLOSE,
        }
    }

    pub fn from_described(descriptor: u64, list: &[Value]) -> Option<Self> {
        let p = match descriptor {
            DESC_OPEN => Performative::Open(Open {
                container_id: field(list, 0).as_str().unwrap_or_default().to_string(),
                hostname: field(list, 1).as_str().map(str::to_string),
                max_frame_size: field(list, 2).as_u32(),
                channel_max: field(list, 3).as_u16(),
                idle_timeout: field(list, 4).as_u32(),
            }),
            DESC_BEGIN => Performative::Begin(Begin {
                remote_channel: field(list, 0).as_u16(),
                next_outgoing_id: field(list, 1).as_u32().unwrap_or(0),
                incoming_window: field(list, 2).as_u32().unwrap_or(0),
                outgoing_window: field(list, 3).as_u32().unwrap_or(0),
                handle_max: field(list, 4).as_u32(),
            }),
            DESC_ATTACH => Performative::Attach(Attach {
                name: field(list, 0).as_str().unwrap_or_default().to_string(),
                handle: field(list, 1).as_u32().unwrap_or(0),
                role: field(list, 2).as_bool().unwrap_or(ROLE_SENDER),
                source_address: composite_address(field(list, 5)),
                target_address: composite_address(field(list, 6)),
                initial_delivery_count: field(list, 9).as_u32(),
            }),
            DESC_FLOW => Performative::Flow(Flow {
                next_incoming_id: field(list, 0).as_u32(),
                incoming_window: field(list, 1).as_u32().unwrap_or(0),
                next_outgoing_id: field(list, 2).as_u32().unwrap_or(0),
                outgoing_window: field(list, 3).as_u32().unwrap_or(0),
                handle: field(list, 4).as_u32(),
                delivery_count: field(list, 5).as_u32(),
                link_credit: field(list, 6).as_u32(),
                drain: field(list, 8).as_bool().unwrap_or(false),
            }),
            DESC_TRANSFER => Performative::Transfer(Transfer {
                handle: field(list, 0).as_u32().unwrap_or(0),
                delivery_id: field(list, 1).as_u32(),
                delivery_tag: field(list, 2).as_bytes().cloned(),
                message_format: field(list, 3).as_u32(),
                settled: field(list, 4).as_bool(),
                more: field(list, 5).as_bool().unwrap_or(false),
            }),
            DESC_DISPOSITION => Performative::Disposition(Disposition {
                role: field(list, 0).as_bool().unwrap_or(ROLE_RECEIVER),
                first: field(list, 1).as_u32().unwrap_or(0),
                last: field(list, 2).as_u32(),
                settled: field(list, 3).as_bool().unwrap_or(false),
                state: DeliveryState::from_value(field(list, 4)),
            }),
            DESC_DETACH => Performative::Detach(Detach {
                handle: field(list, 0).as_u32().unwrap_or(0),
                closed: field(list, 1).as_bool().unwrap_or(false),
                error: AmqpError::from_value(field(list, 2)),
            }),
            DESC_END => Performative::End(End {
                error: AmqpError::from_value(field(list, 0)),
            }),
            DESC_CLOSE => Performative::Close(Close {
                error: AmqpError::from_value(field(list, 0)),
            }),
            _ => return None,
        };
        Some(p)
    }

    pub fn to_list(&self) -> Vec<Value> {
        fn opt_u32(v: Option<u32>) -> Value {
            v.map(Value::Uint).unwrap_or(Value::Null)
        }
        fn opt_u16(v: Option<u16>) -> Value {
            v.map(Value::Ushort).unwrap_or(Value::Null)
        }
        fn opt_str(v: &Option<String>) -> Value {
            v.clone().map(Value::String).unwrap_or(Value::Null)
        }
        fn opt_error(v: &Option<AmqpError>) -> Value {
            v.as_ref().map(AmqpError::to_value).unwrap_or(Value::Null)
        }

        match self {
            Performative::Open(open) => vec![
                Value::String(open.container_id.clone()),
                opt_str(&open.hostname),
                opt_u32(open.max_frame_size),
                opt_u16(open.channel_max),
                opt_u32(open.idle_timeout),
            ],
            Performative::Begin(begin) => vec![
                opt_u16(begin.remote_channel),
                Value::Uint(begin.next_outgoing_id),
                Value::Uint(begin.incoming_window),
                Value::Uint(begin.outgoing_window),
                opt_u32(begin.handle_max),
            ],
            Performative::Attach(attach) => vec![
                Value::String(attach.name.clone()),
                Value::Uint(attach.handle),
                Value::Bool(attach.role),
                Value::Null, // snd-settle-mode
                Value::Null, // rcv-settle-mode
                address_composite(DESC_SOURCE, &attach.source_address),
                address_composite(DESC_TARGET, &attach.target_address),
                Value::Null, // unsettled
                Value::Null, // incomplete-unsettled
                opt_u32(attach.initial_delivery_count),
            ],
            Performative::Flow(flow) => vec![
                opt_u32(flow.next_incoming_id),
                Value::Uint(flow.incoming_window),
                Value::Uint(flow.next_outgoing_id),
                Value::Uint(flow.outgoing_window),
                opt_u32(flow.handle),
                opt_u32(flow.delivery_count),
                opt_u32(flow.link_credit),
                Value::Null, // available
                Value::Bool(flow.drain),
            ],
            Performative::Transfer(transfer) => vec![
                Value::Uint(transfer.handle),
                opt_u32(transfer.delivery_id),
                transfer
                    .delivery_tag
                    .clone()
                    .map(Value::Binary)
                    .unwrap_or(Value::Null),
                opt_u32(transfer.message_format),
                transfer.settled.map(Value::Bool).unwrap_or(Value::Null),
                Value::Bool(transfer.more),
            ],
            Performative::Disposition(disposition) => vec![
                Value::Bool(disposition.role),
                Value::Uint(disposition.first),
                opt_u32(disposition.last),
                Value::Bool(disposition.settled),
                disposition
                    .state
                    .as_ref()
                    .map(DeliveryState::to_value)
                    .unwrap_or(Value::Null),
            ],
            Performative::Detach(detach) => vec![
                Value::Uint(detach.handle),
                Value::Bool(detach.closed),
                opt_error(&detach.error),
            ],
            Performative::End(end) => vec![opt_error(&end.error)],
            Performative::Close(close) => vec![opt_error(&close.error)],
        }
    }
}

fn composite_address(value: &Value) -> Option<String> {
    match value {
        Value::Described(DESC_SOURCE | DESC_TARGET, body) => match body.as_ref() {
            Value::List(list) => field(list, 0).as_str().map(str::to_string),
            _ => None,
        },
        _ => None,
    }
}

fn address_composite(descriptor: u64, address: &Option<String>) -> Value {
    Value::Described(
        descriptor,
        Box::new(Value::List(vec![match address {
            Some(a) => Value::String(a.clone()),
            None => Value::Null,
        }])),
    )
}

// ---- bare message encoding ----

/// Encode a broker message as an AMQP 1.0 bare message: properties,
/// application-properties, and one data section.
pub fn encode_message(message: &Message) -> Bytes {
    let mut properties = vec![
        message
            .message_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null), // message-id
        Value::Null,                 // user-id
        Value::Null,                 // to
        Value::String(message.routing_key.clone()), // subject
        Value::Null,                 // reply-to
        message
            .correlation_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        message
            .content_type
            .clone()
            .map(Value::Symbol)
            .unwrap_or(Value::Null),
        Value::Null, // content-encoding
        Value::Null, // absolute-expiry-time
        Value::Timestamp(message.timestamp as i64),
    ];
    while matches!(properties.last(), Some(Value::Null)) {
        properties.pop();
    }

    let mut out = bytes::BytesMut::new();
    codec::encode_value(
        &Value::Described(DESC_MSG_PROPERTIES, Box::new(Value::List(properties))),
        &mut out,
    );

    if !message.headers.is_empty() {
        let mut pairs: Vec<(Value, Value)> = message
            .headers
            .iter()
            .map(|(name, value)| (Value::String(name.clone()), field_to_value(value)))
            .collect();
        pairs.sort_by(|a, b| format!("{:?}", a.0).cmp(&format!("{:?}", b.0)));
        codec::encode_value(
            &Value::Described(DESC_MSG_APP_PROPERTIES, Box::new(Value::Map(pairs))),
            &mut out,
        );
    }

    codec::encode_value(
        &Value::Described(DESC_MSG_DATA, Box::new(Value::Binary(message.body.clone()))),
        &mut out,
    );
    out.freeze()
}

/// Decode an AMQP 1.0 bare message into the broker's message model.
pub fn decode_message(payload: &Bytes) -> Result<Message, Amqp1CodecError> {
    let mut message = Message::default();
    let mut src = payload.clone();

    while !src.is_empty() {
        let value = codec::decode_value(&mut src)?;
        let Value::Described(descriptor, body) = value else {
            continue;
        };
        match descriptor {
            DESC_MSG_PROPERTIES => {
                if let Value::List(list) = body.as_ref() {
                    message.message_id = field(list, 0).as_str().map(str::to_string);
                    if let Some(subject) = field(list, 3).as_str() {
                        message.routing_key = subject.to_string();
                    }
                    message.correlation_id = field(list, 5).as_str().map(str::to_string);
                    message.content_type = field(list, 6).as_str().map(str::to_string);
                    if let Value::Timestamp(ts) = field(list, 9) {
                        message.timestamp = *ts as u64;
                    }
                }
            }
            DESC_MSG_APP_PROPERTIES => {
                if let Value::Map(pairs) = body.as_ref() {
                    for (name, value) in pairs {
                        if let Some(name) = name.as_str() {
                            message
                                .headers
                                .insert(name.to_string(), value_to_field(value));
                        }
                    }
                }
            }
            DESC_MSG_DATA => {
                if let Value::Binary(data) = body.as_ref() {
                    message.body = data.clone();
                }
            }
            _ => {} // header, annotations, footer: ignored
        }
    }
    Ok(message)
}

fn field_to_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Bool(v) => Value::Bool(*v),
        FieldValue::I8(v) => Value::Int(*v as i32),
        FieldValue::I16(v) => Value::Int(*v as i32),
        FieldValue::I32(v) => Value::Int(*v),
        FieldValue::I64(v) => Value::Long(*v),
        FieldValue::Double(v) => Value::String(v.to_string()),
        FieldValue::Timestamp(v) => Value::Timestamp(*v as i64),
        FieldValue::String(v) => Value::String(v.clone()),
        FieldValue::Bytes(v) => Value::Binary(Bytes::from(v.clone())),
        FieldValue::Array(_) | FieldValue::Table(_) => Value::Null,
        FieldValue::Void => Value::Null,
    }
}

fn value_to_field(value: &Value) -> FieldValue {
    match value {
        Value::Bool(v) => FieldValue::Bool(*v),
        Value::Ubyte(v) => FieldValue::I32(*v as i32),
        Value::Ushort(v) => FieldValue::I32(*v as i32),
        Value::Uint(v) => FieldValue::I64(*v as i64),
        Value::Ulong(v) => FieldValue::I64(*v as i64),
        Value::Int(v) => FieldValue::I32(*v),
        Value::Long(v) => FieldValue::I64(*v),
        Value::Timestamp(v) => FieldValue::Timestamp(*v as u64),
        Value::String(v) | Value::Symbol(v) => FieldValue::String(v.clone()),
        Value::Binary(v) => FieldValue::Bytes(v.to_vec()),
        _ => FieldValue::Void,
    }
}
