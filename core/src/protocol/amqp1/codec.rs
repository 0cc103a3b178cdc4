//! AMQP 1.0 frame and primitive-type codec.
//!
//! Descriptor encoding is `0x00` followed by an unsigned long; composites are
//! list0/list8/list32 with an element count. Unknown descriptors and unknown
//! primitive constructors are malformed frames and terminate the connection.

use super::{
    Frame, Performative, ProtocolId, SaslFrame, Value, DESC_SASL_INIT, DESC_SASL_MECHANISMS,
    DESC_SASL_OUTCOME, FRAME_TYPE_AMQP, FRAME_TYPE_SASL, PROTO_HEADER_AMQP, PROTO_HEADER_SASL,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;
const FRAME_HEADER_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum Amqp1CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("frame size over limit")]
    FrameTooBig,
}

type Result<T> = std::result::Result<T, Amqp1CodecError>;

fn malformed(msg: impl Into<String>) -> Amqp1CodecError {
    Amqp1CodecError::MalformedFrame(msg.into())
}

pub struct Amqp1Codec {
    expect_header: bool,
    max_frame_size: u32,
}

impl Default for Amqp1Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Amqp1Codec {
    pub fn new() -> Self {
        Self {
            expect_header: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Expect the next bytes to be a protocol header again (after a SASL
    /// outcome the client restarts with the AMQP header).
    pub fn expect_protocol_header(&mut self) {
        self.expect_header = true;
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size.max(super::MIN_MAX_FRAME_SIZE);
    }
}

impl Decoder for Amqp1Codec {
    type Item = Frame;
    type Error = Amqp1CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if self.expect_header {
            if src.len() < 8 {
                return Ok(None);
            }
            let header = src.split_to(8);
            let id = if header[..] == PROTO_HEADER_AMQP {
                ProtocolId::Amqp
            } else if header[..] == PROTO_HEADER_SASL {
                ProtocolId::Sasl
            } else {
                return Err(malformed("unrecognized protocol header"));
            };
            self.expect_header = false;
            return Ok(Some(Frame::ProtocolHeader(id)));
        }

        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if size < FRAME_HEADER_SIZE as u32 {
            return Err(malformed("frame size below header size"));
        }
        if size > self.max_frame_size {
            return Err(Amqp1CodecError::FrameTooBig);
        }
        if src.len() < size as usize {
            src.reserve(size as usize - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size as usize);
        let doff = frame[4];
        let kind = frame[5];
        let channel = u16::from_be_bytes([frame[6], frame[7]]);
        let body_start = doff as usize * 4;
        if doff < 2 || body_start > frame.len() {
            return Err(malformed("bad data offset"));
        }
        let mut body = Bytes::copy_from_slice(&frame[body_start..]);

        if body.is_empty() {
            return Ok(Some(Frame::Empty { channel }));
        }

        let value = decode_value(&mut body)?;
        let Value::Described(descriptor, composite) = value else {
            return Err(malformed("frame body is not a described type"));
        };
        let empty = Vec::new();
        let list = match composite.as_ref() {
            Value::List(list) => list,
            Value::Null => &empty,
            _ => return Err(malformed("composite body is not a list")),
        };

        match kind {
            FRAME_TYPE_AMQP => {
                let performative = Performative::from_described(descriptor, list)
                    .ok_or_else(|| malformed(format!("unknown descriptor 0x{:02x}", descriptor)))?;
                Ok(Some(Frame::Amqp {
                    channel,
                    performative,
                    payload: body,
                }))
            }
            FRAME_TYPE_SASL => {
                let frame = decode_sasl(descriptor, list)?;
                Ok(Some(Frame::Sasl(frame)))
            }
            other => Err(malformed(format!("unknown frame type 0x{:02x}", other))),
        }
    }
}

impl Encoder<Frame> for Amqp1Codec {
    type Error = Amqp1CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            Frame::ProtocolHeader(ProtocolId::Amqp) => dst.put_slice(&PROTO_HEADER_AMQP),
            Frame::ProtocolHeader(ProtocolId::Sasl) => dst.put_slice(&PROTO_HEADER_SASL),
            Frame::Empty { channel } => {
                dst.put_u32(FRAME_HEADER_SIZE as u32);
                dst.put_u8(2);
                dst.put_u8(FRAME_TYPE_AMQP);
                dst.put_u16(channel);
            }
            Frame::Amqp {
                channel,
                performative,
                payload,
            } => {
                let mut body = BytesMut::new();
                encode_value(
                    &Value::Described(
                        performative.descriptor(),
                        Box::new(Value::List(performative.to_list())),
                    ),
                    &mut body,
                );
                body.put_slice(&payload);
                put_frame(dst, FRAME_TYPE_AMQP, channel, &body);
            }
            Frame::Sasl(sasl) => {
                let mut body = BytesMut::new();
                let (descriptor, list) = encode_sasl(&sasl);
                encode_value(
                    &Value::Described(descriptor, Box::new(Value::List(list))),
                    &mut body,
                );
                put_frame(dst, FRAME_TYPE_SASL, 0, &body);
            }
        }
        Ok(())
    }
}

fn put_frame(dst: &mut BytesMut, kind: u8, channel: u16, body: &[u8]) {
    dst.put_u32((FRAME_HEADER_SIZE + body.len()) as u32);
    dst.put_u8(2); // doff
    dst.put_u8(kind);
    dst.put_u16(channel);
    dst.put_slice(body);
}

fn decode_sasl(descriptor: u64, list: &[Value]) -> Result<SaslFrame> {
    fn list_field(list: &[Value], index: usize) -> Value {
        list.get(index).cloned().unwrap_or(Value::Null)
    }

    match descriptor {
        DESC_SASL_MECHANISMS => {
            let mechanisms = match list_field(list, 0) {
                Value::Symbol(s) | Value::String(s) => vec![s],
                Value::List(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            Ok(SaslFrame::Mechanisms { mechanisms })
        }
        DESC_SASL_INIT => Ok(SaslFrame::Init {
            mechanism: list_field(list, 0).as_str().unwrap_or_default().to_string(),
            initial_response: list_field(list, 1)
                .as_bytes()
                .cloned()
                .unwrap_or_else(Bytes::new),
        }),
        DESC_SASL_OUTCOME => Ok(SaslFrame::Outcome {
            code: match list_field(list, 0) {
                Value::Ubyte(code) => code,
                other => other.as_u32().unwrap_or(0) as u8,
            },
        }),
        other => Err(malformed(format!("unknown sasl descriptor 0x{:02x}", other))),
    }
}

fn encode_sasl(frame: &SaslFrame) -> (u64, Vec<Value>) {
    match frame {
        SaslFrame::Mechanisms { mechanisms } => (
            DESC_SASL_MECHANISMS,
            vec![Value::List(
                mechanisms.iter().cloned().map(Value::Symbol).collect(),
            )],
        ),
        SaslFrame::Init {
            mechanism,
            initial_response,
        } => (
            DESC_SASL_INIT,
            vec![
                Value::Symbol(mechanism.clone()),
                Value::Binary(initial_response.clone()),
            ],
        ),
        SaslFrame::Outcome { code } => (DESC_SASL_OUTCOME, vec![Value::Ubyte(*code)]),
    }
}

// ---- primitive encoding ----

pub fn encode_value(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Null => dst.put_u8(0x40),
        Value::Bool(true) => dst.put_u8(0x41),
        Value::Bool(false) => dst.put_u8(0x42),
        Value::Ubyte(v) => {
            dst.put_u8(0x50);
            dst.put_u8(*v);
        }
        Value::Ushort(v) => {
            dst.put_u8(0x60);
            dst.put_u16(*v);
        }
        Value::Uint(0) => dst.put_u8(0x43),
        Value::Uint(v) if *v <= u8::MAX as u32 => {
            dst.put_u8(0x52);
            dst.put_u8(*v as u8);
        }
        Value::Uint(v) => {
            dst.put_u8(0x70);
            dst.put_u32(*v);
        }
        Value::Ulong(0) => dst.put_u8(0x44),
        Value::Ulong(v) if *v <= u8::MAX as u64 => {
            dst.put_u8(0x53);
            dst.put_u8(*v as u8);
        }
        Value::Ulong(v) => {
            dst.put_u8(0x80);
            dst.put_u64(*v);
        }
        Value::Int(v) if i8::try_from(*v).is_ok() => {
            dst.put_u8(0x54);
            dst.put_i8(*v as i8);
        }
        Value::Int(v) => {
            dst.put_u8(0x71);
            dst.put_i32(*v);
        }
        Value::Long(v) if i8::try_from(*v).is_ok() => {
            dst.put_u8(0x55);
            dst.put_i8(*v as i8);
        }
        Value::Long(v) => {
            dst.put_u8(0x81);
            dst.put_i64(*v);
        }
        Value::Timestamp(v) => {
            dst.put_u8(0x83);
            dst.put_i64(*v);
        }
        Value::String(v) => put_variable(dst, 0xa1, 0xb1, v.as_bytes()),
        Value::Symbol(v) => put_variable(dst, 0xa3, 0xb3, v.as_bytes()),
        Value::Binary(v) => put_variable(dst, 0xa0, 0xb0, v),
        Value::List(items) => {
            if items.is_empty() {
                dst.put_u8(0x45);
                return;
            }
            let mut body = BytesMut::new();
            for item in items {
                encode_value(item, &mut body);
            }
            put_compound(dst, 0xc0, 0xd0, items.len() as u32, &body);
        }
        Value::Map(pairs) => {
            let mut body = BytesMut::new();
            for (name, value) in pairs {
                encode_value(name, &mut body);
                encode_value(value, &mut body);
            }
            put_compound(dst, 0xc1, 0xd1, (pairs.len() * 2) as u32, &body);
        }
        Value::Described(descriptor, body) => {
            dst.put_u8(0x00);
            encode_value(&Value::Ulong(*descriptor), dst);
            encode_value(body, dst);
        }
    }
}

fn put_variable(dst: &mut BytesMut, small: u8, large: u8, data: &[u8]) {
    if data.len() <= u8::MAX as usize {
        dst.put_u8(small);
        dst.put_u8(data.len() as u8);
    } else {
        dst.put_u8(large);
        dst.put_u32(data.len() as u32);
    }
    dst.put_slice(data);
}

fn put_compound(dst: &mut BytesMut, small: u8, large: u8, count: u32, body: &[u8]) {
    if body.len() + 1 <= u8::MAX as usize && count <= u8::MAX as u32 {
        dst.put_u8(small);
        dst.put_u8(body.len() as u8 + 1);
        dst.put_u8(count as u8);
    } else {
        dst.put_u8(large);
        dst.put_u32(body.len() as u32 + 4);
        dst.put_u32(count);
    }
    dst.put_slice(body);
}

// ---- primitive decoding ----

fn need(src: &Bytes, n: usize) -> Result<()> {
    if src.len() < n {
        return Err(malformed("truncated value"));
    }
    Ok(())
}

pub fn decode_value(src: &mut Bytes) -> Result<Value> {
    need(src, 1)?;
    let code = src.get_u8();
    decode_value_with_code(code, src)
}

fn decode_value_with_code(code: u8, src: &mut Bytes) -> Result<Value> {
    Ok(match code {
        0x00 => {
            let descriptor = match decode_value(src)? {
                Value::Ulong(v) => v,
                Value::Ubyte(v) => v as u64,
                other => {
                    return Err(malformed(format!(
                        "unsupported descriptor encoding: {:?}",
                        other
                    )))
                }
            };
            let body = decode_value(src)?;
            Value::Described(descriptor, Box::new(body))
        }
        0x40 => Value::Null,
        0x41 => Value::Bool(true),
        0x42 => Value::Bool(false),
        0x56 => {
            need(src, 1)?;
            Value::Bool(src.get_u8() != 0)
        }
        0x43 => Value::Uint(0),
        0x44 => Value::Ulong(0),
        0x50 => {
            need(src, 1)?;
            Value::Ubyte(src.get_u8())
        }
        0x51 => {
            need(src, 1)?;
            Value::Int(src.get_i8() as i32)
        }
        0x52 => {
            need(src, 1)?;
            Value::Uint(src.get_u8() as u32)
        }
        0x53 => {
            need(src, 1)?;
            Value::Ulong(src.get_u8() as u64)
        }
        0x54 => {
            need(src, 1)?;
            Value::Int(src.get_i8() as i32)
        }
        0x55 => {
            need(src, 1)?;
            Value::Long(src.get_i8() as i64)
        }
        0x60 => {
            need(src, 2)?;
            Value::Ushort(src.get_u16())
        }
        0x61 => {
            need(src, 2)?;
            Value::Int(src.get_i16() as i32)
        }
        0x70 => {
            need(src, 4)?;
            Value::Uint(src.get_u32())
        }
        0x71 => {
            need(src, 4)?;
            Value::Int(src.get_i32())
        }
        0x80 => {
            need(src, 8)?;
            Value::Ulong(src.get_u64())
        }
        0x81 => {
            need(src, 8)?;
            Value::Long(src.get_i64())
        }
        0x83 => {
            need(src, 8)?;
            Value::Timestamp(src.get_i64())
        }
        0xa0 | 0xa1 | 0xa3 => {
            need(src, 1)?;
            let len = src.get_u8() as usize;
            decode_variable(code, len, src)?
        }
        0xb0 | 0xb1 | 0xb3 => {
            need(src, 4)?;
            let len = src.get_u32() as usize;
            decode_variable(code, len, src)?
        }
        0x45 => Value::List(Vec::new()),
        0xc0 | 0xc1 => {
            need(src, 2)?;
            let _size = src.get_u8();
            let count = src.get_u8() as usize;
            decode_compound(code, count, src)?
        }
        0xd0 | 0xd1 => {
            need(src, 8)?;
            let _size = src.get_u32();
            let count = src.get_u32() as usize;
            decode_compound(code, count, src)?
        }
        0xe0 | 0xf0 => {
            // array: shared constructor followed by count elements
            let count = if code == 0xe0 {
                need(src, 2)?;
                let _size = src.get_u8();
                src.get_u8() as usize
            } else {
                need(src, 8)?;
                let _size = src.get_u32();
                src.get_u32() as usize
            };
            need(src, 1)?;
            let constructor = src.get_u8();
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value_with_code(constructor, src)?);
            }
            Value::List(items)
        }
        other => {
            return Err(malformed(format!(
                "unknown type constructor 0x{:02x}",
                other
            )))
        }
    })
}

fn decode_variable(code: u8, len: usize, src: &mut Bytes) -> Result<Value> {
    need(src, len)?;
    let data = src.split_to(len);
    Ok(match code {
        0xa0 | 0xb0 => Value::Binary(data),
        0xa1 | 0xb1 => Value::String(
            String::from_utf8(data.to_vec()).map_err(|_| malformed("string is not utf-8"))?,
        ),
        _ => Value::Symbol(
            String::from_utf8(data.to_vec()).map_err(|_| malformed("symbol is not utf-8"))?,
        ),
    })
}

fn decode_compound(code: u8, count: usize, src: &mut Bytes) -> Result<Value> {
    if code == 0xc0 || code == 0xd0 {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(decode_value(src)?);
        }
        Ok(Value::List(items))
    } else {
        if count % 2 != 0 {
            return Err(malformed("map with odd element count"));
        }
        let mut pairs = Vec::with_capacity(count / 2);
        for _ in 0..count / 2 {
            let name = decode_value(src)?;
            let value = decode_value(src)?;
            pairs.push((name, value));
        }
        Ok(Value::Map(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{
        decode_message, encode_message, Attach, Begin, Close, Disposition, DeliveryState, Open,
        Transfer,
    };
    use super::*;
    use crate::protocol::{FieldValue, Message};

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = Amqp1Codec::new();
        codec.expect_header = false;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn value_roundtrips() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Ubyte(7),
            Value::Ushort(300),
            Value::Uint(0),
            Value::Uint(200),
            Value::Uint(70_000),
            Value::Ulong(u64::MAX),
            Value::Int(-40_000),
            Value::Long(-3),
            Value::Timestamp(1_700_000_000_000),
            Value::String("hello".to_string()),
            Value::Symbol("amqp:link:detach-forced".to_string()),
            Value::Binary(Bytes::from_static(b"\x00\x01\x02")),
            Value::List(vec![Value::Uint(1), Value::String("x".to_string())]),
            Value::Map(vec![(
                Value::String("k".to_string()),
                Value::Long(1234567890),
            )]),
            Value::Described(0x10, Box::new(Value::List(vec![Value::Null]))),
        ];
        for value in values {
            let mut buf = BytesMut::new();
            encode_value(&value, &mut buf);
            let mut bytes = buf.freeze();
            assert_eq!(decode_value(&mut bytes).unwrap(), value, "{:?}", value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn protocol_headers_decode_first() {
        let mut codec = Amqp1Codec::new();
        let mut buf = BytesMut::from(&PROTO_HEADER_SASL[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Frame::ProtocolHeader(ProtocolId::Sasl)
        );

        codec.expect_protocol_header();
        let mut buf = BytesMut::from(&PROTO_HEADER_AMQP[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Frame::ProtocolHeader(ProtocolId::Amqp)
        );
    }

    #[test]
    fn open_frame_roundtrip() {
        let frame = Frame::Amqp {
            channel: 0,
            performative: Performative::Open(Open {
                container_id: "meshmq".to_string(),
                hostname: Some("default".to_string()),
                max_frame_size: Some(u32::MAX),
                channel_max: Some(1024),
                idle_timeout: Some(60_000),
            }),
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn begin_and_attach_roundtrip() {
        let begin = Frame::Amqp {
            channel: 1,
            performative: Performative::Begin(Begin {
                remote_channel: None,
                next_outgoing_id: 1,
                incoming_window: 2048,
                outgoing_window: 2048,
                handle_max: Some(255),
            }),
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip(begin.clone()), begin);

        let attach = Frame::Amqp {
            channel: 1,
            performative: Performative::Attach(Attach {
                name: "receiver-link".to_string(),
                handle: 0,
                role: super::super::ROLE_RECEIVER,
                source_address: Some("workers".to_string()),
                target_address: None,
                initial_delivery_count: None,
            }),
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip(attach.clone()), attach);
    }

    #[test]
    fn transfer_carries_payload() {
        let frame = Frame::Amqp {
            channel: 1,
            performative: Performative::Transfer(Transfer {
                handle: 0,
                delivery_id: Some(1),
                delivery_tag: Some(Bytes::from_static(b"tag-1")),
                message_format: Some(0),
                settled: Some(false),
                more: false,
            }),
            payload: Bytes::from_static(b"\x00\x53\x75\xa0\x03abc"),
        };
        match roundtrip(frame.clone()) {
            Frame::Amqp {
                performative: Performative::Transfer(t),
                payload,
                ..
            } => {
                assert_eq!(t.delivery_id, Some(1));
                assert_eq!(payload, Bytes::from_static(b"\x00\x53\x75\xa0\x03abc"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn disposition_roundtrip() {
        let frame = Frame::Amqp {
            channel: 1,
            performative: Performative::Disposition(Disposition {
                role: super::super::ROLE_RECEIVER,
                first: 0,
                last: Some(4),
                settled: true,
                state: Some(DeliveryState::Accepted),
            }),
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn close_with_error_roundtrip() {
        let frame = Frame::Amqp {
            channel: 0,
            performative: Performative::Close(Close {
                error: Some(super::super::AmqpError::with_description(
                    "amqp:connection:forced",
                    "client timeout too short",
                )),
            }),
            payload: Bytes::new(),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn sasl_exchange_roundtrip() {
        for frame in [
            Frame::Sasl(SaslFrame::Mechanisms {
                mechanisms: vec!["PLAIN".to_string()],
            }),
            Frame::Sasl(SaslFrame::Init {
                mechanism: "PLAIN".to_string(),
                initial_response: Bytes::from_static(b"\0guest\0guest"),
            }),
            Frame::Sasl(SaslFrame::Outcome { code: 0 }),
        ] {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn empty_frame_is_heartbeat() {
        let frame = Frame::Empty { channel: 0 };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn unknown_descriptor_is_malformed() {
        let mut body = BytesMut::new();
        encode_value(
            &Value::Described(0xbeef, Box::new(Value::List(vec![]))),
            &mut body,
        );
        let mut buf = BytesMut::new();
        put_frame(&mut buf, FRAME_TYPE_AMQP, 0, &body);

        let mut codec = Amqp1Codec::new();
        codec.expect_header = false;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Amqp1CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = Amqp1Codec::new();
        codec.expect_header = false;
        codec.set_max_frame_size(512);

        let mut buf = BytesMut::new();
        buf.put_u32(4096);
        buf.put_u8(2);
        buf.put_u8(FRAME_TYPE_AMQP);
        buf.put_u16(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Amqp1CodecError::FrameTooBig)
        ));
    }

    #[test]
    fn bare_message_roundtrip() {
        let message = Message {
            routing_key: "orders.created".to_string(),
            headers: [("region".to_string(), FieldValue::String("eu".to_string()))].into(),
            body: Bytes::from_static(b"{\"id\":42}"),
            timestamp: 1_700_000_000_000,
            content_type: Some("application/json".to_string()),
            correlation_id: None,
            message_id: Some("m-1".to_string()),
        };

        let encoded = encode_message(&message);
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }
}
