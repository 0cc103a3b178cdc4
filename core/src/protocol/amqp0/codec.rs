//! AMQP 0-9-1 frame codec.
//!
//! Implements [`tokio_util::codec::Decoder`]/[`Encoder`] over the frame
//! layout of §6 of the protocol: 7-byte header, payload, 0xCE end marker.
//! All integers are big-endian. Strings are shortstr (u8 length) or longstr
//! (u32 length); tables are longstr-sized lists of (shortstr, tagged value).

use super::{
    BasicProperties, ContentHeader, Frame, Method, CLASS_BASIC, CLASS_CHANNEL, CLASS_CONNECTION,
    CLASS_EXCHANGE, CLASS_QUEUE, FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT,
    FRAME_METHOD,
};
use crate::protocol::{FieldTable, FieldValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frames the server accepts before tuning completes.
pub const DEFAULT_FRAME_MAX: u32 = 128 * 1024;

#[derive(Debug, Error)]
pub enum Amqp0CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("frame size over limit")]
    FrameTooBig,
    #[error("unsupported method: class {0} method {1}")]
    UnsupportedMethod(u16, u16),
}

type Result<T> = std::result::Result<T, Amqp0CodecError>;

fn malformed(msg: impl Into<String>) -> Amqp0CodecError {
    Amqp0CodecError::MalformedFrame(msg.into())
}

pub struct Amqp0Codec {
    frame_max: u32,
}

impl Default for Amqp0Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Amqp0Codec {
    pub fn new() -> Self {
        Self {
            frame_max: DEFAULT_FRAME_MAX,
        }
    }

    pub fn set_frame_max(&mut self, frame_max: u32) {
        self.frame_max = frame_max;
    }
}

impl Decoder for Amqp0Codec {
    type Item = Frame;
    type Error = Amqp0CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 7 {
            return Ok(None);
        }
        let kind = src[0];
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);
        if size > self.frame_max {
            return Err(Amqp0CodecError::FrameTooBig);
        }
        let total = 7 + size as usize + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(7);
        let end = frame.split_off(size as usize);
        if end[0] != FRAME_END {
            return Err(malformed("missing frame end marker"));
        }
        let mut payload = frame.freeze();

        let frame = match kind {
            FRAME_METHOD => Frame::Method {
                channel,
                method: decode_method(&mut payload)?,
            },
            FRAME_HEADER => Frame::ContentHeader {
                channel,
                header: decode_content_header(&mut payload)?,
            },
            FRAME_BODY => Frame::ContentBody {
                channel,
                payload,
            },
            FRAME_HEARTBEAT => Frame::Heartbeat { channel },
            other => return Err(malformed(format!("unknown frame type {}", other))),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for Amqp0Codec {
    type Error = Amqp0CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let (kind, channel, payload) = match frame {
            Frame::Method { channel, method } => {
                let mut buf = BytesMut::new();
                encode_method(&method, &mut buf);
                (FRAME_METHOD, channel, buf.freeze())
            }
            Frame::ContentHeader { channel, header } => {
                let mut buf = BytesMut::new();
                encode_content_header(&header, &mut buf);
                (FRAME_HEADER, channel, buf.freeze())
            }
            Frame::ContentBody { channel, payload } => (FRAME_BODY, channel, payload),
            Frame::Heartbeat { channel } => (FRAME_HEARTBEAT, channel, Bytes::new()),
        };

        dst.reserve(7 + payload.len() + 1);
        dst.put_u8(kind);
        dst.put_u16(channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

// ---- primitive readers ----

fn need(src: &Bytes, n: usize) -> Result<()> {
    if src.len() < n {
        return Err(malformed("truncated frame payload"));
    }
    Ok(())
}

fn get_u8(src: &mut Bytes) -> Result<u8> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> Result<u16> {
    need(src, 2)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes) -> Result<u32> {
    need(src, 4)?;
    Ok(src.get_u32())
}

fn get_u64(src: &mut Bytes) -> Result<u64> {
    need(src, 8)?;
    Ok(src.get_u64())
}

fn get_shortstr(src: &mut Bytes) -> Result<String> {
    let len = get_u8(src)? as usize;
    need(src, len)?;
    let bytes = src.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed("shortstr is not utf-8"))
}

fn get_longstr(src: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(src)? as usize;
    need(src, len)?;
    Ok(src.split_to(len))
}

fn get_table(src: &mut Bytes) -> Result<FieldTable> {
    let mut data = get_longstr(src)?;
    let mut table = FieldTable::new();
    while !data.is_empty() {
        let name = get_shortstr(&mut data)?;
        let value = get_field_value(&mut data)?;
        table.insert(name, value);
    }
    Ok(table)
}

fn get_field_value(src: &mut Bytes) -> Result<FieldValue> {
    let tag = get_u8(src)?;
    Ok(match tag {
        b't' => FieldValue::Bool(get_u8(src)? != 0),
        b'b' => FieldValue::I8(get_u8(src)? as i8),
        b's' => FieldValue::I16(get_u16(src)? as i16),
        b'I' => FieldValue::I32(get_u32(src)? as i32),
        b'l' => FieldValue::I64(get_u64(src)? as i64),
        b'd' => FieldValue::Double(f64::from_bits(get_u64(src)?)),
        b'T' => FieldValue::Timestamp(get_u64(src)?),
        b'S' => {
            let bytes = get_longstr(src)?;
            FieldValue::String(
                String::from_utf8(bytes.to_vec()).map_err(|_| malformed("longstr is not utf-8"))?,
            )
        }
        b'x' => FieldValue::Bytes(get_longstr(src)?.to_vec()),
        b'A' => {
            let mut data = get_longstr(src)?;
            let mut items = Vec::new();
            while !data.is_empty() {
                items.push(get_field_value(&mut data)?);
            }
            FieldValue::Array(items)
        }
        b'F' => FieldValue::Table(get_table(src)?),
        b'V' => FieldValue::Void,
        other => return Err(malformed(format!("unknown field value tag {}", other))),
    })
}

// ---- primitive writers ----

fn put_shortstr(dst: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize);
    dst.put_u8(s.len() as u8);
    dst.put_slice(s.as_bytes());
}

fn put_longstr(dst: &mut BytesMut, s: &[u8]) {
    dst.put_u32(s.len() as u32);
    dst.put_slice(s);
}

fn put_table(dst: &mut BytesMut, table: &FieldTable) {
    let mut buf = BytesMut::new();
    // sorted for deterministic wire output
    let mut names: Vec<_> = table.keys().collect();
    names.sort();
    for name in names {
        put_shortstr(&mut buf, name);
        put_field_value(&mut buf, &table[name]);
    }
    put_longstr(dst, &buf);
}

fn put_field_value(dst: &mut BytesMut, value: &FieldValue) {
    match value {
        FieldValue::Bool(v) => {
            dst.put_u8(b't');
            dst.put_u8(*v as u8);
        }
        FieldValue::I8(v) => {
            dst.put_u8(b'b');
            dst.put_i8(*v);
        }
        FieldValue::I16(v) => {
            dst.put_u8(b's');
            dst.put_i16(*v);
        }
        FieldValue::I32(v) => {
            dst.put_u8(b'I');
            dst.put_i32(*v);
        }
        FieldValue::I64(v) => {
            dst.put_u8(b'l');
            dst.put_i64(*v);
        }
        FieldValue::Double(v) => {
            dst.put_u8(b'd');
            dst.put_u64(v.to_bits());
        }
        FieldValue::Timestamp(v) => {
            dst.put_u8(b'T');
            dst.put_u64(*v);
        }
        FieldValue::String(v) => {
            dst.put_u8(b'S');
            put_longstr(dst, v.as_bytes());
        }
        FieldValue::Bytes(v) => {
            dst.put_u8(b'x');
            put_longstr(dst, v);
        }
        FieldValue::Array(items) => {
            dst.put_u8(b'A');
            let mut buf = BytesMut::new();
            for item in items {
                put_field_value(&mut buf, item);
            }
            put_longstr(dst, &buf);
        }
        FieldValue::Table(table) => {
            dst.put_u8(b'F');
            put_table(dst, table);
        }
        FieldValue::Void => dst.put_u8(b'V'),
    }
}

fn put_bits(dst: &mut BytesMut, bits: &[bool]) {
    debug_assert!(bits.len() <= 8);
    let mut octet = 0u8;
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            octet |= 1 << i;
        }
    }
    dst.put_u8(octet);
}

fn get_bits<const N: usize>(src: &mut Bytes) -> Result<[bool; N]> {
    let octet = get_u8(src)?;
    let mut bits = [false; N];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = octet & (1 << i) != 0;
    }
    Ok(bits)
}

// ---- methods ----

fn decode_method(src: &mut Bytes) -> Result<Method> {
    let class_id = get_u16(src)?;
    let method_id = get_u16(src)?;

    let method = match (class_id, method_id) {
        (CLASS_CONNECTION, 10) => Method::ConnectionStart {
            version_major: get_u8(src)?,
            version_minor: get_u8(src)?,
            server_properties: get_table(src)?,
            mechanisms: longstr_utf8(src)?,
            locales: longstr_utf8(src)?,
        },
        (CLASS_CONNECTION, 11) => Method::ConnectionStartOk {
            client_properties: get_table(src)?,
            mechanism: get_shortstr(src)?,
            response: get_longstr(src)?,
            locale: get_shortstr(src)?,
        },
        (CLASS_CONNECTION, 30) => Method::ConnectionTune {
            channel_max: get_u16(src)?,
            frame_max: get_u32(src)?,
            heartbeat: get_u16(src)?,
        },
        (CLASS_CONNECTION, 31) => Method::ConnectionTuneOk {
            channel_max: get_u16(src)?,
            frame_max: get_u32(src)?,
            heartbeat: get_u16(src)?,
        },
        (CLASS_CONNECTION, 40) => {
            let virtual_host = get_shortstr(src)?;
            let _reserved = get_shortstr(src)?;
            let _insist = get_bits::<1>(src)?;
            Method::ConnectionOpen { virtual_host }
        }
        (CLASS_CONNECTION, 41) => {
            let _reserved = get_shortstr(src)?;
            Method::ConnectionOpenOk
        }
        (CLASS_CONNECTION, 50) => Method::ConnectionClose {
            reply_code: get_u16(src)?,
            reply_text: get_shortstr(src)?,
            class_id: get_u16(src)?,
            method_id: get_u16(src)?,
        },
        (CLASS_CONNECTION, 51) => Method::ConnectionCloseOk,

        (CLASS_CHANNEL, 10) => {
            let _reserved = get_shortstr(src)?;
            Method::ChannelOpen
        }
        (CLASS_CHANNEL, 11) => {
            let _reserved = get_longstr(src)?;
            Method::ChannelOpenOk
        }
        (CLASS_CHANNEL, 40) => Method::ChannelClose {
            reply_code: get_u16(src)?,
            reply_text: get_shortstr(src)?,
            class_id: get_u16(src)?,
            method_id: get_u16(src)?,
        },
        (CLASS_CHANNEL, 41) => Method::ChannelCloseOk,

        (CLASS_EXCHANGE, 10) => {
            let _reserved = get_u16(src)?;
            let exchange = get_shortstr(src)?;
            let kind = get_shortstr(src)?;
            let [passive, durable, auto_delete, internal, no_wait] = get_bits::<5>(src)?;
            Method::ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments: get_table(src)?,
            }
        }
        (CLASS_EXCHANGE, 11) => Method::ExchangeDeclareOk,
        (CLASS_EXCHANGE, 20) => {
            let _reserved = get_u16(src)?;
            let exchange = get_shortstr(src)?;
            let [if_unused, no_wait] = get_bits::<2>(src)?;
            Method::ExchangeDelete {
                exchange,
                if_unused,
                no_wait,
            }
        }
        (CLASS_EXCHANGE, 21) => Method::ExchangeDeleteOk,

        (CLASS_QUEUE, 10) => {
            let _reserved = get_u16(src)?;
            let queue = get_shortstr(src)?;
            let [passive, durable, exclusive, auto_delete, no_wait] = get_bits::<5>(src)?;
            Method::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments: get_table(src)?,
            }
        }
        (CLASS_QUEUE, 11) => Method::QueueDeclareOk {
            queue: get_shortstr(src)?,
            message_count: get_u32(src)?,
            consumer_count: get_u32(src)?,
        },
        (CLASS_QUEUE, 20) => {
            let _reserved = get_u16(src)?;
            let queue = get_shortstr(src)?;
            let exchange = get_shortstr(src)?;
            let routing_key = get_shortstr(src)?;
            let [no_wait] = get_bits::<1>(src)?;
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments: get_table(src)?,
            }
        }
        (CLASS_QUEUE, 21) => Method::QueueBindOk,
        (CLASS_QUEUE, 40) => {
            let _reserved = get_u16(src)?;
            let queue = get_shortstr(src)?;
            let [if_unused, if_empty, no_wait] = get_bits::<3>(src)?;
            Method::QueueDelete {
                queue,
                if_unused,
                if_empty,
                no_wait,
            }
        }
        (CLASS_QUEUE, 41) => Method::QueueDeleteOk {
            message_count: get_u32(src)?,
        },
        (CLASS_QUEUE, 50) => {
            let _reserved = get_u16(src)?;
            Method::QueueUnbind {
                queue: get_shortstr(src)?,
                exchange: get_shortstr(src)?,
                routing_key: get_shortstr(src)?,
                arguments: get_table(src)?,
            }
        }
        (CLASS_QUEUE, 51) => Method::QueueUnbindOk,

        (CLASS_BASIC, 10) => {
            let prefetch_size = get_u32(src)?;
            let prefetch_count = get_u16(src)?;
            let [global] = get_bits::<1>(src)?;
            Method::BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            }
        }
        (CLASS_BASIC, 11) => Method::BasicQosOk,
        (CLASS_BASIC, 20) => {
            let _reserved = get_u16(src)?;
            let queue = get_shortstr(src)?;
            let consumer_tag = get_shortstr(src)?;
            let [no_local, no_ack, exclusive, no_wait] = get_bits::<4>(src)?;
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments: get_table(src)?,
            }
        }
        (CLASS_BASIC, 21) => Method::BasicConsumeOk {
            consumer_tag: get_shortstr(src)?,
        },
        (CLASS_BASIC, 30) => {
            let consumer_tag = get_shortstr(src)?;
            let [no_wait] = get_bits::<1>(src)?;
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            }
        }
        (CLASS_BASIC, 31) => Method::BasicCancelOk {
            consumer_tag: get_shortstr(src)?,
        },
        (CLASS_BASIC, 40) => {
            let _reserved = get_u16(src)?;
            let exchange = get_shortstr(src)?;
            let routing_key = get_shortstr(src)?;
            let [mandatory, immediate] = get_bits::<2>(src)?;
            Method::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            }
        }
        (CLASS_BASIC, 60) => {
            let consumer_tag = get_shortstr(src)?;
            let delivery_tag = get_u64(src)?;
            let [redelivered] = get_bits::<1>(src)?;
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange: get_shortstr(src)?,
                routing_key: get_shortstr(src)?,
            }
        }
        (CLASS_BASIC, 80) => {
            let delivery_tag = get_u64(src)?;
            let [multiple] = get_bits::<1>(src)?;
            Method::BasicAck {
                delivery_tag,
                multiple,
            }
        }
        (CLASS_BASIC, 90) => {
            let delivery_tag = get_u64(src)?;
            let [requeue] = get_bits::<1>(src)?;
            Method::BasicReject {
                delivery_tag,
                requeue,
            }
        }
        (CLASS_BASIC, 120) => {
            let delivery_tag = get_u64(src)?;
            let [multiple, requeue] = get_bits::<2>(src)?;
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            }
        }

        (class, method) => return Err(Amqp0CodecError::UnsupportedMethod(class, method)),
    };
    Ok(method)
}

fn longstr_utf8(src: &mut Bytes) -> Result<String> {
    let bytes = get_longstr(src)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed("longstr is not utf-8"))
}

fn encode_method(method: &Method, dst: &mut BytesMut) {
    let (class_id, method_id) = method.ids();
    dst.put_u16(class_id);
    dst.put_u16(method_id);

    match method {
        Method::ConnectionStart {
            version_major,
            version_minor,
            server_properties,
            mechanisms,
            locales,
        } => {
            dst.put_u8(*version_major);
            dst.put_u8(*version_minor);
            put_table(dst, server_properties);
            put_longstr(dst, mechanisms.as_bytes());
            put_longstr(dst, locales.as_bytes());
        }
        Method::ConnectionStartOk {
            client_properties,
            mechanism,
            response,
            locale,
        } => {
            put_table(dst, client_properties);
            put_shortstr(dst, mechanism);
            put_longstr(dst, response);
            put_shortstr(dst, locale);
        }
        Method::ConnectionTune {
            channel_max,
            frame_max,
            heartbeat,
        }
        | Method::ConnectionTuneOk {
            channel_max,
            frame_max,
            heartbeat,
        } => {
            dst.put_u16(*channel_max);
            dst.put_u32(*frame_max);
            dst.put_u16(*heartbeat);
        }
        Method::ConnectionOpen { virtual_host } => {
            put_shortstr(dst, virtual_host);
            put_shortstr(dst, "");
            put_bits(dst, &[false]);
        }
        Method::ConnectionOpenOk => put_shortstr(dst, ""),
        Method::ConnectionClose {
            reply_code,
            reply_text,
            class_id,
            method_id,
        }
        | Method::ChannelClose {
            reply_code,
            reply_text,
            class_id,
            method_id,
        } => {
            dst.put_u16(*reply_code);
            put_shortstr(dst, reply_text);
            dst.put_u16(*class_id);
            dst.put_u16(*method_id);
        }
        Method::ConnectionCloseOk | Method::ChannelCloseOk => {}
        Method::ChannelOpen => put_shortstr(dst, ""),
        Method::ChannelOpenOk => put_longstr(dst, b""),
        Method::ExchangeDeclare {
            exchange,
            kind,
            passive,
            durable,
            auto_delete,
            internal,
            no_wait,
            arguments,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, exchange);
            put_shortstr(dst, kind);
            put_bits(dst, &[*passive, *durable, *auto_delete, *internal, *no_wait]);
            put_table(dst, arguments);
        }
        Method::ExchangeDeclareOk | Method::ExchangeDeleteOk => {}
        Method::ExchangeDelete {
            exchange,
            if_unused,
            no_wait,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, exchange);
            put_bits(dst, &[*if_unused, *no_wait]);
        }
        Method::QueueDeclare {
            queue,
            passive,
            durable,
            exclusive,
            auto_delete,
            no_wait,
            arguments,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, queue);
            put_bits(dst, &[*passive, *durable, *exclusive, *auto_delete, *no_wait]);
            put_table(dst, arguments);
        }
        Method::QueueDeclareOk {
            queue,
            message_count,
            consumer_count,
        } => {
            put_shortstr(dst, queue);
            dst.put_u32(*message_count);
            dst.put_u32(*consumer_count);
        }
        Method::QueueBind {
            queue,
            exchange,
            routing_key,
            no_wait,
            arguments,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, queue);
            put_shortstr(dst, exchange);
            put_shortstr(dst, routing_key);
            put_bits(dst, &[*no_wait]);
            put_table(dst, arguments);
        }
        Method::QueueBindOk | Method::QueueUnbindOk => {}
        Method::QueueUnbind {
            queue,
            exchange,
            routing_key,
            arguments,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, queue);
            put_shortstr(dst, exchange);
            put_shortstr(dst, routing_key);
            put_table(dst, arguments);
        }
        Method::QueueDelete {
            queue,
            if_unused,
            if_empty,
            no_wait,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, queue);
            put_bits(dst, &[*if_unused, *if_empty, *no_wait]);
        }
        Method::QueueDeleteOk { message_count } => dst.put_u32(*message_count),
        Method::BasicQos {
            prefetch_size,
            prefetch_count,
            global,
        } => {
            dst.put_u32(*prefetch_size);
            dst.put_u16(*prefetch_count);
            put_bits(dst, &[*global]);
        }
        Method::BasicQosOk => {}
        Method::BasicConsume {
            queue,
            consumer_tag,
            no_local,
            no_ack,
            exclusive,
            no_wait,
            arguments,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, queue);
            put_shortstr(dst, consumer_tag);
            put_bits(dst, &[*no_local, *no_ack, *exclusive, *no_wait]);
            put_table(dst, arguments);
        }
        Method::BasicConsumeOk { consumer_tag } | Method::BasicCancelOk { consumer_tag } => {
            put_shortstr(dst, consumer_tag)
        }
        Method::BasicCancel {
            consumer_tag,
            no_wait,
        } => {
            put_shortstr(dst, consumer_tag);
            put_bits(dst, &[*no_wait]);
        }
        Method::BasicPublish {
            exchange,
            routing_key,
            mandatory,
            immediate,
        } => {
            dst.put_u16(0);
            put_shortstr(dst, exchange);
            put_shortstr(dst, routing_key);
            put_bits(dst, &[*mandatory, *immediate]);
        }
        Method::BasicDeliver {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
        } => {
            put_shortstr(dst, consumer_tag);
            dst.put_u64(*delivery_tag);
            put_bits(dst, &[*redelivered]);
            put_shortstr(dst, exchange);
            put_shortstr(dst, routing_key);
        }
        Method::BasicAck {
            delivery_tag,
            multiple,
        } => {
            dst.put_u64(*delivery_tag);
            put_bits(dst, &[*multiple]);
        }
        Method::BasicReject {
            delivery_tag,
            requeue,
        } => {
            dst.put_u64(*delivery_tag);
            put_bits(dst, &[*requeue]);
        }
        Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        } => {
            dst.put_u64(*delivery_tag);
            put_bits(dst, &[*multiple, *requeue]);
        }
    }
}

// ---- content header ----

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

fn decode_content_header(src: &mut Bytes) -> Result<ContentHeader> {
    let class_id = get_u16(src)?;
    let _weight = get_u16(src)?;
    let body_size = get_u64(src)?;
    let flags = get_u16(src)?;

    let mut properties = BasicProperties::default();
    if flags & FLAG_CONTENT_TYPE != 0 {
        properties.content_type = Some(get_shortstr(src)?);
    }
    if flags & FLAG_CONTENT_ENCODING != 0 {
        properties.content_encoding = Some(get_shortstr(src)?);
    }
    if flags & FLAG_HEADERS != 0 {
        properties.headers = Some(get_table(src)?);
    }
    if flags & FLAG_DELIVERY_MODE != 0 {
        properties.delivery_mode = Some(get_u8(src)?);
    }
    if flags & FLAG_PRIORITY != 0 {
        properties.priority = Some(get_u8(src)?);
    }
    if flags & FLAG_CORRELATION_ID != 0 {
        properties.correlation_id = Some(get_shortstr(src)?);
    }
    if flags & FLAG_REPLY_TO != 0 {
        properties.reply_to = Some(get_shortstr(src)?);
    }
    if flags & FLAG_EXPIRATION != 0 {
        properties.expiration = Some(get_shortstr(src)?);
    }
    if flags & FLAG_MESSAGE_ID != 0 {
        properties.message_id = Some(get_shortstr(src)?);
    }
    if flags & FLAG_TIMESTAMP != 0 {
        properties.timestamp = Some(get_u64(src)?);
    }
    if flags & FLAG_TYPE != 0 {
        properties.kind = Some(get_shortstr(src)?);
    }
    if flags & FLAG_USER_ID != 0 {
        properties.user_id = Some(get_shortstr(src)?);
    }
    if flags & FLAG_APP_ID != 0 {
        properties.app_id = Some(get_shortstr(src)?);
    }
    if flags & FLAG_CLUSTER_ID != 0 {
        properties.cluster_id = Some(get_shortstr(src)?);
    }

    Ok(ContentHeader {
        class_id,
        body_size,
        properties,
    })
}

fn encode_content_header(header: &ContentHeader, dst: &mut BytesMut) {
    dst.put_u16(header.class_id);
    dst.put_u16(0); // weight
    dst.put_u64(header.body_size);

    let p = &header.properties;
    let mut flags = 0u16;
    let mut body = BytesMut::new();

    if let Some(v) = &p.content_type {
        flags |= FLAG_CONTENT_TYPE;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.content_encoding {
        flags |= FLAG_CONTENT_ENCODING;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.headers {
        flags |= FLAG_HEADERS;
        put_table(&mut body, v);
    }
    if let Some(v) = p.delivery_mode {
        flags |= FLAG_DELIVERY_MODE;
        body.put_u8(v);
    }
    if let Some(v) = p.priority {
        flags |= FLAG_PRIORITY;
        body.put_u8(v);
    }
    if let Some(v) = &p.correlation_id {
        flags |= FLAG_CORRELATION_ID;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.reply_to {
        flags |= FLAG_REPLY_TO;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.expiration {
        flags |= FLAG_EXPIRATION;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.message_id {
        flags |= FLAG_MESSAGE_ID;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = p.timestamp {
        flags |= FLAG_TIMESTAMP;
        body.put_u64(v);
    }
    if let Some(v) = &p.kind {
        flags |= FLAG_TYPE;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.user_id {
        flags |= FLAG_USER_ID;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.app_id {
        flags |= FLAG_APP_ID;
        put_shortstr(&mut body, v);
    }
    if let Some(v) = &p.cluster_id {
        flags |= FLAG_CLUSTER_ID;
        put_shortstr(&mut body, v);
    }

    dst.put_u16(flags);
    dst.put_slice(&body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = Amqp0Codec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn method_frame_roundtrip() {
        let frame = Frame::Method {
            channel: 3,
            method: Method::ExchangeDeclare {
                exchange: "events".to_string(),
                kind: "topic".to_string(),
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                no_wait: false,
                arguments: [("shards".to_string(), FieldValue::I32(4))].into(),
            },
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn bit_fields_pack_into_one_octet() {
        let frame = Frame::Method {
            channel: 1,
            method: Method::BasicNack {
                delivery_tag: 7,
                multiple: true,
                requeue: true,
            },
        };
        let mut codec = Amqp0Codec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        // header(7) + class(2) + method(2) + tag(8) + bits(1) + end(1)
        assert_eq!(buf.len(), 21);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn content_header_roundtrip() {
        let frame = Frame::ContentHeader {
            channel: 1,
            header: ContentHeader {
                class_id: CLASS_BASIC,
                body_size: 11,
                properties: BasicProperties {
                    content_type: Some("text/plain".to_string()),
                    headers: Some(
                        [("x".to_string(), FieldValue::String("y".to_string()))].into(),
                    ),
                    delivery_mode: Some(2),
                    timestamp: Some(1234),
                    ..Default::default()
                },
            },
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn heartbeat_roundtrip() {
        assert_eq!(
            roundtrip(Frame::Heartbeat { channel: 0 }),
            Frame::Heartbeat { channel: 0 }
        );
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = Amqp0Codec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Heartbeat { channel: 0 }, &mut buf)
            .unwrap();
        let mut partial = buf.split_to(3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn bad_end_marker_is_malformed() {
        let mut codec = Amqp0Codec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Heartbeat { channel: 0 }, &mut buf)
            .unwrap();
        let last = buf.len() - 1;
        buf[last] = 0x00;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Amqp0CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = Amqp0Codec::new();
        codec.set_frame_max(16);
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_BODY);
        buf.put_u16(1);
        buf.put_u32(1024);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Amqp0CodecError::FrameTooBig)
        ));
    }

    #[test]
    fn field_table_roundtrips_nested_values() {
        let frame = Frame::Method {
            channel: 1,
            method: Method::QueueBind {
                queue: "q".to_string(),
                exchange: "e".to_string(),
                routing_key: "k".to_string(),
                no_wait: false,
                arguments: [
                    ("x-match".to_string(), FieldValue::String("all".to_string())),
                    ("count".to_string(), FieldValue::I64(-5)),
                    ("flag".to_string(), FieldValue::Bool(true)),
                    (
                        "list".to_string(),
                        FieldValue::Array(vec![FieldValue::I32(1), FieldValue::Void]),
                    ),
                ]
                .into(),
            },
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }
}
