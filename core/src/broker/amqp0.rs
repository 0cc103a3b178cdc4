//! AMQP 0-9-1 session handler.
//!
//! One task per connection. After the handshake the main loop multiplexes
//! client frames, deliveries fanned in from consumer tasks, the heartbeat
//! ticker, and shutdown. Frames on one channel are processed strictly in
//! receive order.

use super::rpc::WireDelivery;
use super::Broker;
use crate::cluster::{Binding, BindingMatch, ClusterConsumerGroup, ClusterTopic, TopicKind};
use crate::protocol::amqp0::{
    self, table_u32, table_u64, Amqp0Codec, BasicProperties, ContentHeader, Frame, Method,
};
use crate::protocol::{now_millis, sasl, FieldValue, Message};
use crate::{MeshmqError, Result};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

const CHANNEL_MAX: u16 = 2047;
const HEARTBEAT_SECS: u16 = 60;
const SERVER_PRODUCT: &str = "meshmq";

type Transport = Framed<TcpStream, Amqp0Codec>;

/// Channel-scoped or connection-scoped protocol error, mapped onto the
/// matching close frame.
enum SessionError {
    Channel { code: u16, text: String },
    Connection { code: u16, text: String },
}

impl SessionError {
    fn channel(code: u16, text: impl Into<String>) -> Self {
        SessionError::Channel {
            code,
            text: text.into(),
        }
    }

    fn connection(code: u16, text: impl Into<String>) -> Self {
        SessionError::Connection {
            code,
            text: text.into(),
        }
    }

    fn from_broker(err: MeshmqError) -> Self {
        match &err {
            MeshmqError::NotFound { .. } => {
                SessionError::channel(amqp0::NOT_FOUND, err.to_string())
            }
            MeshmqError::Validation(_) | MeshmqError::PreconditionFailed(_) => {
                SessionError::channel(amqp0::PRECONDITION_FAILED, err.to_string())
            }
            MeshmqError::NotImplemented(_) => {
                SessionError::connection(amqp0::NOT_IMPLEMENTED, err.to_string())
            }
            MeshmqError::Syntax(_) => SessionError::connection(amqp0::SYNTAX_ERROR, err.to_string()),
            _ => SessionError::connection(amqp0::INTERNAL_ERROR, err.to_string()),
        }
    }
}

#[derive(PartialEq)]
enum ChannelState {
    Ready,
    Closing,
}

struct InflightDelivery {
    delivery_tag: u64,
    node_id: u64,
    subscription_id: u64,
    seq_no: u64,
}

struct PublishState {
    exchange: String,
    routing_key: String,
    body_size: u64,
    properties: BasicProperties,
    body: BytesMut,
}

struct ConsumerHandle {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Channel {
    id: u16,
    state: ChannelState,
    /// Ordered by delivery tag (monotonic per channel).
    inflight: Vec<InflightDelivery>,
    next_delivery_tag: u64,
    publish: Option<PublishState>,
    prefetch: u16,
    consumers: HashMap<String, ConsumerHandle>,
    next_consumer_tag: u64,
}

impl Channel {
    fn new(id: u16) -> Self {
        Self {
            id,
            state: ChannelState::Ready,
            inflight: Vec::new(),
            next_delivery_tag: 0,
            publish: None,
            prefetch: 0,
            consumers: HashMap::new(),
            next_consumer_tag: 0,
        }
    }
}

/// Serve one 0-9-1 connection. The protocol header has already been read.
pub async fn serve(broker: Arc<Broker>, stream: TcpStream) -> Result<()> {
    let mut transport = Framed::new(stream, Amqp0Codec::new());

    let namespace = match handshake(&broker, &mut transport).await? {
        Some(namespace) => namespace,
        None => return Ok(()), // refused during handshake
    };

    session_loop(broker, transport, namespace).await
}

/// Start/StartOk (SASL PLAIN), Tune/TuneOk, Open/OpenOk. Returns the
/// namespace the connection is bound to, mapping vhost `/` to `default`.
async fn handshake(broker: &Arc<Broker>, transport: &mut Transport) -> Result<Option<String>> {
    let server_properties = [(
        "product".to_string(),
        FieldValue::String(SERVER_PRODUCT.to_string()),
    )]
    .into();
    send_method(
        transport,
        0,
        Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: sasl::MECHANISM_PLAIN.to_string(),
            locales: "en_US".to_string(),
        },
    )
    .await?;

    let Method::ConnectionStartOk {
        mechanism,
        response,
        ..
    } = expect_method(transport).await?
    else {
        return Err(MeshmqError::Syntax("expected connection.start-ok".to_string()));
    };
    if mechanism != sasl::MECHANISM_PLAIN {
        force_close(transport, amqp0::ACCESS_REFUSED, "unsupported SASL mechanism").await?;
        return Ok(None);
    }
    match broker.sasl().authenticate(&response).await {
        Ok(token) => debug!("authenticated {}", token.subject()),
        Err(e) => {
            force_close(transport, amqp0::ACCESS_REFUSED, &e.to_string()).await?;
            return Ok(None);
        }
    }

    send_method(
        transport,
        0,
        Method::ConnectionTune {
            channel_max: CHANNEL_MAX,
            frame_max: amqp0::codec::DEFAULT_FRAME_MAX,
            heartbeat: HEARTBEAT_SECS,
        },
    )
    .await?;
    let Method::ConnectionTuneOk { frame_max, .. } = expect_method(transport).await? else {
        return Err(MeshmqError::Syntax("expected connection.tune-ok".to_string()));
    };
    if frame_max != 0 {
        transport.codec_mut().set_frame_max(frame_max);
    }

    let Method::ConnectionOpen { virtual_host } = expect_method(transport).await? else {
        return Err(MeshmqError::Syntax("expected connection.open".to_string()));
    };
    send_method(transport, 0, Method::ConnectionOpenOk).await?;

    Ok(Some(if virtual_host == "/" {
        "default".to_string()
    } else {
        virtual_host
    }))
}

async fn session_loop(
    broker: Arc<Broker>,
    mut transport: Transport,
    namespace: String,
) -> Result<()> {
    let mut channels: HashMap<u16, Channel> = HashMap::new();
    let (deliveries_tx, mut deliveries_rx) =
        mpsc::channel::<(u16, String, WireDelivery, bool)>(64);
    let mut shutdown = broker.subscribe_shutdown();
    let heartbeat = Duration::from_secs(HEARTBEAT_SECS as u64 / 2);
    let mut heartbeats =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    heartbeats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                return force_close(&mut transport, amqp0::CONNECTION_FORCED, "shutdown").await;
            }
            _ = heartbeats.tick() => {
                transport.send(Frame::Heartbeat { channel: 0 }).await?;
            }
            Some((channel_id, consumer_tag, delivery, no_ack)) = deliveries_rx.recv() => {
                if let Some(channel) = channels.get_mut(&channel_id) {
                    if let Err(e) =
                        send_delivery(&mut transport, channel, &consumer_tag, delivery, no_ack).await
                    {
                        return force_close(&mut transport, amqp0::INTERNAL_ERROR, &e.to_string())
                            .await;
                    }
                }
            }
            frame = transport.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        let code = match e {
                            amqp0::Amqp0CodecError::FrameTooBig => amqp0::FRAME_ERROR,
                            amqp0::Amqp0CodecError::UnsupportedMethod(..) => amqp0::SYNTAX_ERROR,
                            _ => amqp0::FRAME_ERROR,
                        };
                        return force_close(&mut transport, code, "malformed frame").await;
                    }
                    None => return Ok(()), // client hung up
                };

                match handle_frame(
                    &broker,
                    &mut transport,
                    &namespace,
                    &mut channels,
                    &deliveries_tx,
                    frame,
                )
                .await
                {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    // channel errors are absorbed per-channel inside
                    // handle_frame; anything that reaches here closes the
                    // connection
                    Err(SessionError::Channel { code, text })
                    | Err(SessionError::Connection { code, text }) => {
                        warn!("closing connection: {} ({})", text, code);
                        return force_close(&mut transport, code, &text).await;
                    }
                }
            }
        }
    }
}

/// Returns Ok(false) when the connection should end gracefully.
async fn handle_frame(
    broker: &Arc<Broker>,
    transport: &mut Transport,
    namespace: &str,
    channels: &mut HashMap<u16, Channel>,
    deliveries_tx: &mpsc::Sender<(u16, String, WireDelivery, bool)>,
    frame: Frame,
) -> std::result::Result<bool, SessionError> {
    match frame {
        Frame::Heartbeat { channel: 0 } => Ok(true),
        Frame::Heartbeat { .. } => Err(SessionError::connection(
            amqp0::SYNTAX_ERROR,
            "heartbeat frame on non-zero channel",
        )),

        Frame::Method { channel: 0, method } => match method {
            Method::ConnectionClose { .. } => {
                let _ = send_method(transport, 0, Method::ConnectionCloseOk).await;
                Ok(false)
            }
            Method::ConnectionCloseOk => Ok(false),
            _ => Err(SessionError::connection(
                amqp0::SYNTAX_ERROR,
                "non-close frame on channel zero",
            )),
        },

        Frame::Method { channel, method } => match method {
            Method::ChannelOpen => {
                if channels.contains_key(&channel) {
                    return Err(SessionError::connection(
                        amqp0::CHANNEL_ERROR,
                        "channel already open",
                    ));
                }
                channels.insert(channel, Channel::new(channel));
                send_ok(transport, channel, Method::ChannelOpenOk).await?;
                Ok(true)
            }
            Method::ChannelClose { .. } => {
                let Some(mut ch) = channels.remove(&channel) else {
                    return Err(SessionError::connection(
                        amqp0::CHANNEL_ERROR,
                        "trying to close channel that isn't open",
                    ));
                };
                release_channel(broker, &mut ch).await;
                send_ok(transport, channel, Method::ChannelCloseOk).await?;
                Ok(true)
            }
            Method::ChannelCloseOk => {
                let Some(ch) = channels.get(&channel) else {
                    return Err(SessionError::connection(
                        amqp0::CHANNEL_ERROR,
                        "channel not open",
                    ));
                };
                if ch.state != ChannelState::Closing {
                    return Err(SessionError::connection(
                        amqp0::SYNTAX_ERROR,
                        "channel not closing",
                    ));
                }
                let mut ch = channels.remove(&channel).expect("checked above");
                release_channel(broker, &mut ch).await;
                Ok(true)
            }
            method => {
                if !channels.contains_key(&channel) {
                    return Err(SessionError::connection(
                        amqp0::CHANNEL_ERROR,
                        "channel not open",
                    ));
                }
                let result = handle_channel_method(
                    broker,
                    transport,
                    namespace,
                    channels.get_mut(&channel).expect("checked above"),
                    deliveries_tx,
                    method,
                )
                .await;
                let ch = channels.get_mut(&channel).expect("checked above");
                absorb_channel_error(transport, ch, result).await?;
                Ok(true)
            }
        },

        Frame::ContentHeader { channel, header } => {
            if channel == 0 {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    "content header frame on zero channel",
                ));
            }
            let Some(ch) = channels.get_mut(&channel) else {
                return Err(SessionError::connection(
                    amqp0::CHANNEL_ERROR,
                    "channel not open",
                ));
            };
            let result = match handle_content_header(ch, header) {
                Ok(()) => maybe_complete_publish(broker, namespace, ch).await,
                Err(e) => Err(e),
            };
            absorb_channel_error(transport, ch, result).await?;
            Ok(true)
        }

        Frame::ContentBody { channel, payload } => {
            if channel == 0 {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    "content body frame on zero channel",
                ));
            }
            let Some(ch) = channels.get_mut(&channel) else {
                return Err(SessionError::connection(
                    amqp0::CHANNEL_ERROR,
                    "channel not open",
                ));
            };
            let Some(publish) = ch.publish.as_mut() else {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    "content body without publish",
                ));
            };
            if publish.body_size == u64::MAX {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    "content body before content header",
                ));
            }
            if publish.body.len() as u64 + payload.len() as u64 > publish.body_size {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    "content body exceeds declared size",
                ));
            }
            publish.body.extend_from_slice(&payload);
            let result = maybe_complete_publish(broker, namespace, ch).await;
            absorb_channel_error(transport, ch, result).await?;
            Ok(true)
        }
    }
}

/// Channel-scoped failures close the channel and keep the connection;
/// connection-scoped failures propagate.
async fn absorb_channel_error(
    transport: &mut Transport,
    ch: &mut Channel,
    result: std::result::Result<(), SessionError>,
) -> std::result::Result<(), SessionError> {
    match result {
        Ok(()) => Ok(()),
        Err(SessionError::Channel { code, text }) => {
            ch.state = ChannelState::Closing;
            send_method(
                transport,
                ch.id,
                Method::ChannelClose {
                    reply_code: code,
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                },
            )
            .await
            .map_err(|e| SessionError::connection(amqp0::INTERNAL_ERROR, e.to_string()))?;
            Ok(())
        }
        Err(connection) => Err(connection),
    }
}

fn handle_content_header(
    ch: &mut Channel,
    header: ContentHeader,
) -> std::result::Result<(), SessionError> {
    let Some(publish) = ch.publish.as_mut() else {
        return Err(SessionError::connection(
            amqp0::SYNTAX_ERROR,
            "content header without publish",
        ));
    };
    if publish.body_size != u64::MAX {
        return Err(SessionError::connection(
            amqp0::SYNTAX_ERROR,
            "duplicate content header",
        ));
    }
    publish.body_size = header.body_size;
    publish.properties = header.properties;
    Ok(())
}

/// Route and append once header and full body have arrived.
async fn maybe_complete_publish(
    broker: &Arc<Broker>,
    namespace: &str,
    ch: &mut Channel,
) -> std::result::Result<(), SessionError> {
    let complete = ch
        .publish
        .as_ref()
        .map(|p| p.body_size != u64::MAX && p.body.len() as u64 == p.body_size)
        .unwrap_or(false);
    if !complete {
        return Ok(());
    }
    let publish = ch.publish.take().expect("checked above");

    let properties = publish.properties;
    let message = Message {
        routing_key: publish.routing_key,
        headers: properties.headers.unwrap_or_default(),
        body: publish.body.freeze(),
        timestamp: properties.timestamp.unwrap_or_else(now_millis),
        content_type: properties.content_type,
        correlation_id: properties.correlation_id,
        message_id: properties.message_id,
    };

    broker
        .publish(namespace, &publish.exchange, message)
        .await
        .map_err(SessionError::from_broker)?;
    Ok(())
}

async fn handle_channel_method(
    broker: &Arc<Broker>,
    transport: &mut Transport,
    namespace: &str,
    ch: &mut Channel,
    deliveries_tx: &mpsc::Sender<(u16, String, WireDelivery, bool)>,
    method: Method,
) -> std::result::Result<(), SessionError> {
    match method {
        Method::ExchangeDeclare {
            exchange,
            kind,
            passive,
            durable: _,
            auto_delete,
            internal,
            no_wait,
            arguments,
        } => {
            if auto_delete || internal {
                return Err(SessionError::connection(
                    amqp0::NOT_IMPLEMENTED,
                    "auto-delete and internal exchanges are not supported",
                ));
            }
            let Some(topic_kind) = TopicKind::parse(&kind) else {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    format!("unknown exchange type {:?}", kind),
                ));
            };
            let shards = table_u32(&arguments, "shards", 1)
                .map_err(|e| SessionError::connection(amqp0::SYNTAX_ERROR, e))?;
            let replication_factor = table_u32(&arguments, "replication-factor", 1)
                .map_err(|e| SessionError::connection(amqp0::SYNTAX_ERROR, e))?;
            let retention = table_u64(&arguments, "retention", 0)
                .map_err(|e| SessionError::connection(amqp0::SYNTAX_ERROR, e))?;

            if passive {
                let state = broker.state().current();
                if state.find_namespace(namespace).is_none() {
                    return Err(SessionError::channel(
                        amqp0::NOT_FOUND,
                        format!("vhost {:?} not found", namespace),
                    ));
                }
                if state.get_topic(namespace, &exchange).is_none() {
                    return Err(SessionError::channel(
                        amqp0::NOT_FOUND,
                        format!("exchange {:?} not found", exchange),
                    ));
                }
            } else {
                broker
                    .create_topic(
                        namespace,
                        ClusterTopic {
                            name: exchange,
                            kind: topic_kind,
                            shards,
                            replication_factor,
                            retention: Duration::from_millis(retention),
                        },
                        false,
                    )
                    .await
                    .map_err(SessionError::from_broker)?;
            }

            if !no_wait {
                send_ok(transport, ch.id, Method::ExchangeDeclareOk).await?;
            }
            Ok(())
        }

        Method::ExchangeDelete {
            exchange,
            if_unused,
            no_wait,
        } => {
            if exchange.is_empty() {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    "cannot delete the default exchange",
                ));
            }
            if if_unused {
                return Err(SessionError::connection(
                    amqp0::NOT_IMPLEMENTED,
                    "if-unused delete is not supported",
                ));
            }
            broker
                .delete_topic(namespace, &exchange, false)
                .await
                .map_err(SessionError::from_broker)?;
            if !no_wait {
                send_ok(transport, ch.id, Method::ExchangeDeleteOk).await?;
            }
            Ok(())
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
            if !durable || exclusive || auto_delete {
                return Err(SessionError::connection(
                    amqp0::NOT_IMPLEMENTED,
                    "non-durable, exclusive and auto-delete queues are not supported",
                ));
            }
            let size = table_u32(&arguments, "size", 0)
                .map_err(|e| SessionError::connection(amqp0::SYNTAX_ERROR, e))?;

            let queue = if queue.is_empty() {
                format!("amq-{}", uuid::Uuid::new_v4())
            } else {
                queue
            };

            let state = broker.state().current();
            let existing = state.find_consumer_group(namespace, &queue);

            if passive {
                if existing.is_none() {
                    return Err(SessionError::channel(
                        amqp0::NOT_FOUND,
                        format!("queue {:?} not found", queue),
                    ));
                }
            } else {
                // re-declaration keeps the group's existing bindings
                let bindings = existing.map(|g| g.bindings.clone()).unwrap_or_default();
                broker
                    .create_consumer_group(
                        namespace,
                        ClusterConsumerGroup {
                            name: queue.clone(),
                            size,
                            since: 0,
                            bindings,
                            offset_commits: Vec::new(),
                        },
                        false,
                    )
                    .await
                    .map_err(SessionError::from_broker)?;
            }

            if !no_wait {
                broker
                    .consumer_group_wait(namespace, &queue, false)
                    .await
                    .map_err(SessionError::from_broker)?;
                send_ok(
                    transport,
                    ch.id,
                    Method::QueueDeclareOk {
                        queue,
                        message_count: 0,
                        consumer_count: 0,
                    },
                )
                .await?;
            }
            Ok(())
        }

        Method::QueueBind {
            queue,
            exchange,
            routing_key,
            no_wait,
            arguments,
        } => {
            let binding = binding_for(broker, namespace, &exchange, &routing_key, &arguments)?;
            rebind(broker, namespace, &queue, |bindings| {
                if !bindings.contains(&binding) {
                    bindings.push(binding.clone());
                }
            })
            .await?;
            if !no_wait {
                send_ok(transport, ch.id, Method::QueueBindOk).await?;
            }
            Ok(())
        }

        Method::QueueUnbind {
            queue,
            exchange,
            routing_key,
            arguments,
        } => {
            let binding = binding_for(broker, namespace, &exchange, &routing_key, &arguments)?;
            rebind(broker, namespace, &queue, |bindings| {
                bindings.retain(|b| *b != binding);
            })
            .await?;
            send_ok(transport, ch.id, Method::QueueUnbindOk).await?;
            Ok(())
        }

        Method::QueueDelete {
            queue,
            if_unused,
            if_empty,
            no_wait,
        } => {
            if if_unused || if_empty {
                return Err(SessionError::connection(
                    amqp0::NOT_IMPLEMENTED,
                    "conditional queue delete is not supported",
                ));
            }
            broker
                .delete_consumer_group(namespace, &queue, false)
                .await
                .map_err(SessionError::from_broker)?;
            if !no_wait {
                send_ok(transport, ch.id, Method::QueueDeleteOk { message_count: 0 }).await?;
            }
            Ok(())
        }

        Method::BasicQos {
            prefetch_count, ..
        } => {
            ch.prefetch = prefetch_count;
            send_ok(transport, ch.id, Method::BasicQosOk).await?;
            Ok(())
        }

        Method::BasicPublish {
            exchange,
            routing_key,
            mandatory: _,
            immediate,
        } => {
            if immediate {
                return Err(SessionError::connection(
                    amqp0::NOT_IMPLEMENTED,
                    "immediate publish is not supported",
                ));
            }
            if ch.publish.is_some() {
                return Err(SessionError::connection(
                    amqp0::SYNTAX_ERROR,
                    "publish while content is pending",
                ));
            }
            ch.publish = Some(PublishState {
                exchange,
                routing_key,
                body_size: u64::MAX, // until the content header arrives
                properties: BasicProperties::default(),
                body: BytesMut::new(),
            });
            Ok(())
        }

        Method::BasicConsume {
            queue,
            consumer_tag,
            no_local: _,
            no_ack,
            exclusive,
            no_wait,
            arguments: _,
        } => {
            if exclusive {
                return Err(SessionError::connection(
                    amqp0::NOT_IMPLEMENTED,
                    "exclusive consumers are not supported",
                ));
            }
            let consumer_tag = if consumer_tag.is_empty() {
                ch.next_consumer_tag += 1;
                format!("ctag-{}.{}", ch.id, ch.next_consumer_tag)
            } else {
                consumer_tag
            };
            if ch.consumers.contains_key(&consumer_tag) {
                return Err(SessionError::channel(
                    amqp0::PRECONDITION_FAILED,
                    format!("consumer tag {:?} already in use", consumer_tag),
                ));
            }

            let credit = if no_ack { 0 } else { ch.prefetch as u32 };
            let mut stream = broker
                .subscribe(namespace, &queue, credit, false)
                .await
                .map_err(SessionError::from_broker)?;

            let task = {
                let deliveries_tx = deliveries_tx.clone();
                let broker = Arc::clone(broker);
                let channel_id = ch.id;
                let consumer_tag = consumer_tag.clone();
                tokio::spawn(async move {
                    loop {
                        match stream.next().await {
                            Ok(delivery) => {
                                // auto-ack consumers settle before the frame
                                // is even written
                                if no_ack {
                                    let _ = broker
                                        .ack(
                                            delivery.node_id,
                                            delivery.subscription_id,
                                            delivery.seq_no,
                                        )
                                        .await;
                                }
                                if deliveries_tx
                                    .send((channel_id, consumer_tag.clone(), delivery, no_ack))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                })
            };
            ch.consumers.insert(consumer_tag.clone(), ConsumerHandle { task });

            if !no_wait {
                send_ok(transport, ch.id, Method::BasicConsumeOk { consumer_tag }).await?;
            }
            Ok(())
        }

        Method::BasicCancel {
            consumer_tag,
            no_wait,
        } => {
            ch.consumers.remove(&consumer_tag);
            if !no_wait {
                send_ok(transport, ch.id, Method::BasicCancelOk { consumer_tag }).await?;
            }
            Ok(())
        }

        Method::BasicAck {
            delivery_tag,
            multiple,
        } => settle(broker, ch, delivery_tag, multiple, Settle::Ack).await,

        Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        } => {
            settle(
                broker,
                ch,
                delivery_tag,
                multiple,
                Settle::Nack { requeue },
            )
            .await
        }

        Method::BasicReject {
            delivery_tag,
            requeue,
        } => settle(broker, ch, delivery_tag, false, Settle::Nack { requeue }).await,

        other => Err(SessionError::connection(
            amqp0::SYNTAX_ERROR,
            format!("unexpected method {:?}", other.ids()),
        )),
    }
}

#[derive(Clone, Copy)]
enum Settle {
    Ack,
    Nack { requeue: bool },
}

/// Apply ack/nack to the channel's inflight list. With `multiple`, every
/// entry with tag ≤ `delivery_tag` settles in tag order.
async fn settle(
    broker: &Arc<Broker>,
    ch: &mut Channel,
    delivery_tag: u64,
    multiple: bool,
    settle: Settle,
) -> std::result::Result<(), SessionError> {
    let selected: Vec<usize> = if multiple {
        (0..ch.inflight.len())
            .take_while(|&i| ch.inflight[i].delivery_tag <= delivery_tag)
            .collect()
    } else {
        ch.inflight
            .iter()
            .position(|entry| entry.delivery_tag == delivery_tag)
            .into_iter()
            .collect()
    };

    if selected.is_empty() {
        return Err(SessionError::channel(
            amqp0::PRECONDITION_FAILED,
            format!("delivery tag {} doesn't exist", delivery_tag),
        ));
    }

    for &index in &selected {
        let entry = &ch.inflight[index];
        let result = match settle {
            Settle::Ack => {
                broker
                    .ack(entry.node_id, entry.subscription_id, entry.seq_no)
                    .await
            }
            Settle::Nack { requeue } => {
                broker
                    .nack(entry.node_id, entry.subscription_id, entry.seq_no, requeue)
                    .await
            }
        };
        result.map_err(SessionError::from_broker)?;
    }

    // selected indices are ascending; remove from the back
    for &index in selected.iter().rev() {
        ch.inflight.remove(index);
    }
    Ok(())
}

fn binding_for(
    broker: &Arc<Broker>,
    namespace: &str,
    exchange: &str,
    routing_key: &str,
    arguments: &crate::protocol::FieldTable,
) -> std::result::Result<Binding, SessionError> {
    let state = broker.state().current();
    let topic = state.get_topic(namespace, exchange).ok_or_else(|| {
        SessionError::channel(
            amqp0::NOT_FOUND,
            format!("exchange {:?} not found", exchange),
        )
    })?;

    let by = match topic.kind {
        TopicKind::Fanout => BindingMatch::Fanout,
        TopicKind::Direct | TopicKind::Topic => BindingMatch::RoutingKey(routing_key.to_string()),
        TopicKind::Headers => {
            let mut headers = arguments.clone();
            let x_match = headers.remove("x-match");
            match x_match.as_ref().and_then(|v| match v {
                FieldValue::String(s) => Some(s.as_str()),
                _ => None,
            }) {
                Some("any") => BindingMatch::HeadersAny(headers),
                Some("all") | None => BindingMatch::HeadersAll(headers),
                Some(other) => {
                    return Err(SessionError::connection(
                        amqp0::SYNTAX_ERROR,
                        format!("unknown x-match value {:?}", other),
                    ))
                }
            }
        }
    };

    Ok(Binding {
        topic_name: exchange.to_string(),
        by,
    })
}

/// Re-issue the group's create command with an edited binding list.
async fn rebind(
    broker: &Arc<Broker>,
    namespace: &str,
    queue: &str,
    edit: impl FnOnce(&mut Vec<Binding>),
) -> std::result::Result<(), SessionError> {
    let state = broker.state().current();
    let group = state.find_consumer_group(namespace, queue).ok_or_else(|| {
        SessionError::channel(amqp0::NOT_FOUND, format!("queue {:?} not found", queue))
    })?;

    let mut updated = (**group).clone();
    edit(&mut updated.bindings);
    updated.offset_commits = Vec::new(); // applier keeps the committed ones

    broker
        .create_consumer_group(namespace, updated, false)
        .await
        .map(|_| ())
        .map_err(SessionError::from_broker)
}

async fn send_delivery(
    transport: &mut Transport,
    channel: &mut Channel,
    consumer_tag: &str,
    delivery: WireDelivery,
    no_ack: bool,
) -> Result<()> {
    channel.next_delivery_tag += 1;
    let delivery_tag = channel.next_delivery_tag;

    if !no_ack {
        channel.inflight.push(InflightDelivery {
            delivery_tag,
            node_id: delivery.node_id,
            subscription_id: delivery.subscription_id,
            seq_no: delivery.seq_no,
        });
    }

    let message = delivery.message;
    send_method(
        transport,
        channel.id,
        Method::BasicDeliver {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            redelivered: false,
            exchange: delivery.topic,
            routing_key: message.routing_key.clone(),
        },
    )
    .await?;
    transport
        .send(Frame::ContentHeader {
            channel: channel.id,
            header: ContentHeader {
                class_id: amqp0::CLASS_BASIC,
                body_size: message.body.len() as u64,
                properties: BasicProperties {
                    content_type: message.content_type,
                    headers: if message.headers.is_empty() {
                        None
                    } else {
                        Some(message.headers)
                    },
                    correlation_id: message.correlation_id,
                    message_id: message.message_id,
                    timestamp: Some(message.timestamp),
                    ..Default::default()
                },
            },
        })
        .await?;
    transport
        .send(Frame::ContentBody {
            channel: channel.id,
            payload: message.body,
        })
        .await?;
    Ok(())
}

/// Release a channel's resources: consumers stop, unsettled deliveries go
/// back to their groups.
async fn release_channel(broker: &Arc<Broker>, ch: &mut Channel) {
    ch.consumers.clear();
    for entry in ch.inflight.drain(..) {
        if let Err(e) = broker
            .nack(entry.node_id, entry.subscription_id, entry.seq_no, true)
            .await
        {
            debug!("requeue on channel close failed: {}", e);
        }
    }
}

async fn send_method(transport: &mut Transport, channel: u16, method: Method) -> Result<()> {
    transport
        .send(Frame::Method { channel, method })
        .await
        .map_err(|e| MeshmqError::Internal(e.to_string()))
}

async fn send_ok(
    transport: &mut Transport,
    channel: u16,
    method: Method,
) -> std::result::Result<(), SessionError> {
    send_method(transport, channel, method)
        .await
        .map_err(|e| SessionError::connection(amqp0::INTERNAL_ERROR, e.to_string()))
}

async fn expect_method(transport: &mut Transport) -> Result<Method> {
    match transport.next().await {
        Some(Ok(Frame::Method { method, .. })) => Ok(method),
        Some(Ok(other)) => Err(MeshmqError::Syntax(format!(
            "unexpected frame on channel {}",
            other.channel()
        ))),
        Some(Err(e)) => Err(MeshmqError::MalformedFrame(e.to_string())),
        None => Err(MeshmqError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed during handshake",
        ))),
    }
}

async fn force_close(transport: &mut Transport, reply_code: u16, reply_text: &str) -> Result<()> {
    send_method(
        transport,
        0,
        Method::ConnectionClose {
            reply_code,
            reply_text: reply_text.to_string(),
            class_id: 0,
            method_id: 0,
        },
    )
    .await
}
