//! AMQP 1.0 session handler.
//!
//! SASL negotiation, the Open exchange with idle-timeout validation, then
//! session (Begin/End) and link (Attach/Detach) state machines with
//! credit-based flow. Client sender links publish into topics via Transfer;
//! client receiver links subscribe to consumer groups, with Disposition
//! ranges mapped onto the runtime's ack/nack.

use super::rpc::WireDelivery;
use super::{Broker, SubscriberStream};
use crate::protocol::amqp1::{
    self, Amqp1Codec, AmqpError, Attach, Begin, Close, DeliveryState, Detach, Disposition, End,
    Flow, Frame, Open, Performative, ProtocolId, SaslFrame, Transfer, ROLE_RECEIVER, ROLE_SENDER,
};
use crate::protocol::sasl;
use crate::{MeshmqError, Result};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

const CONTAINER_ID: &str = "meshmq";
const MIN_IDLE_TIMEOUT_MS: u32 = 1_000;
const MAX_IDLE_TIMEOUT_MS: u32 = 3_600_000;
const SESSION_WINDOW: u32 = 2_048;

type Transport = Framed<TcpStream, Amqp1Codec>;

struct SenderLink {
    /// Pump task moving deliveries from the subscription into the session.
    task: Option<tokio::task::JoinHandle<()>>,
    source: String,
    delivery_count: u32,
    subscription: Option<(u64, Arc<crate::consumers::ConsumerGroup>)>,
}

impl Drop for SenderLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum LinkKind {
    /// Client publishes to us; target address is a topic.
    Receiver { target: String },
    /// We deliver to the client; source address is a consumer group.
    Sender(SenderLink),
}

struct Link {
    kind: LinkKind,
}

struct Session {
    next_outgoing_id: u32,
    next_incoming_id: u32,
    next_delivery_id: u32,
    links: HashMap<u32, Link>,
    /// Handles we detached with an error, awaiting the peer's echo.
    closing_links: std::collections::HashSet<u32>,
    /// delivery-id -> (node, subscription, seq-no) awaiting disposition.
    unsettled: HashMap<u32, (u64, u64, u64)>,
}

impl Session {
    fn new() -> Self {
        Self {
            next_outgoing_id: 0,
            next_incoming_id: 0,
            next_delivery_id: 0,
            links: HashMap::new(),
            closing_links: std::collections::HashSet::new(),
            unsettled: HashMap::new(),
        }
    }
}

/// Serve one AMQP 1.0 connection. `header` is the preamble already read by
/// the listener; it is pushed back so the codec sees the full exchange.
pub async fn serve(broker: Arc<Broker>, stream: TcpStream, header: [u8; 8]) -> Result<()> {
    let mut parts = FramedParts::new(stream, Amqp1Codec::new());
    parts.read_buf = BytesMut::from(&header[..]);
    let mut transport = Framed::from_parts(parts);

    // SASL phase, if the client asked for it
    match transport.next().await {
        Some(Ok(Frame::ProtocolHeader(ProtocolId::Sasl))) => {
            if !sasl_exchange(&broker, &mut transport).await? {
                return Ok(());
            }
            match transport.next().await {
                Some(Ok(Frame::ProtocolHeader(ProtocolId::Amqp))) => {}
                _ => return Err(MeshmqError::MalformedFrame(
                    "expected AMQP header after SASL".to_string(),
                )),
            }
        }
        Some(Ok(Frame::ProtocolHeader(ProtocolId::Amqp))) => {}
        _ => {
            return Err(MeshmqError::MalformedFrame(
                "expected protocol header".to_string(),
            ))
        }
    }
    transport.send(Frame::ProtocolHeader(ProtocolId::Amqp)).await?;

    // Open exchange with idle-timeout validation
    let client_open = match transport.next().await {
        Some(Ok(Frame::Amqp {
            performative: Performative::Open(open),
            ..
        })) => open,
        _ => return Err(MeshmqError::MalformedFrame("expected open".to_string())),
    };

    let idle_timeout = client_open.idle_timeout.unwrap_or(0);
    let mut server_open = Open {
        container_id: CONTAINER_ID.to_string(),
        hostname: None,
        max_frame_size: Some(u32::MAX),
        channel_max: Some(u16::MAX),
        idle_timeout: Some(idle_timeout),
    };
    if !(MIN_IDLE_TIMEOUT_MS..=MAX_IDLE_TIMEOUT_MS).contains(&idle_timeout) {
        let reason = if idle_timeout < MIN_IDLE_TIMEOUT_MS {
            "client timeout too short"
        } else {
            "client timeout too long"
        };
        server_open.idle_timeout = Some(60_000);
        send_performative(&mut transport, 0, Performative::Open(server_open)).await?;
        send_performative(
            &mut transport,
            0,
            Performative::Close(Close {
                error: Some(AmqpError::new(reason)),
            }),
        )
        .await?;
        return Ok(());
    }
    send_performative(&mut transport, 0, Performative::Open(server_open)).await?;

    let namespace = match client_open.hostname.as_deref() {
        None | Some("") | Some("/") => "default".to_string(),
        Some(hostname) => hostname.to_string(),
    };

    session_loop(broker, transport, namespace, idle_timeout).await
}

/// Returns false when authentication failed and the connection should end.
async fn sasl_exchange(broker: &Arc<Broker>, transport: &mut Transport) -> Result<bool> {
    transport.send(Frame::ProtocolHeader(ProtocolId::Sasl)).await?;
    transport
        .send(Frame::Sasl(SaslFrame::Mechanisms {
            mechanisms: vec![sasl::MECHANISM_PLAIN.to_string()],
        }))
        .await?;

    let (mechanism, response) = match transport.next().await {
        Some(Ok(Frame::Sasl(SaslFrame::Init {
            mechanism,
            initial_response,
        }))) => (mechanism, initial_response),
        _ => {
            return Err(MeshmqError::MalformedFrame(
                "expected sasl-init".to_string(),
            ))
        }
    };

    if mechanism != sasl::MECHANISM_PLAIN {
        transport
            .send(Frame::Sasl(SaslFrame::Outcome { code: 2 }))
            .await?;
        return Ok(false);
    }
    match broker.sasl().authenticate(&response).await {
        Ok(token) => {
            debug!("authenticated {}", token.subject());
            transport
                .send(Frame::Sasl(SaslFrame::Outcome { code: 0 }))
                .await?;
            transport.codec_mut().expect_protocol_header();
            Ok(true)
        }
        Err(_) => {
            transport
                .send(Frame::Sasl(SaslFrame::Outcome { code: 1 }))
                .await?;
            Ok(false)
        }
    }
}

async fn session_loop(
    broker: Arc<Broker>,
    mut transport: Transport,
    namespace: String,
    idle_timeout_ms: u32,
) -> Result<()> {
    let mut sessions: HashMap<u16, Session> = HashMap::new();
    let (deliveries_tx, mut deliveries_rx) = mpsc::channel::<(u16, u32, WireDelivery)>(64);
    let mut shutdown = broker.subscribe_shutdown();

    // heartbeats at half the negotiated idle, give up at twice it
    let heartbeat = Duration::from_millis(idle_timeout_ms as u64 / 2);
    let receive_timeout = Duration::from_millis(idle_timeout_ms as u64 * 2);
    let mut heartbeats =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    heartbeats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut read_deadline = tokio::time::Instant::now() + receive_timeout;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                return close_connection(&mut transport, "shutdown").await;
            }
            _ = heartbeats.tick() => {
                transport.send(Frame::Empty { channel: 0 }).await?;
            }
            _ = tokio::time::sleep_until(read_deadline) => {
                return close_connection(&mut transport, "idle timeout expired").await;
            }
            Some((channel, handle, delivery)) = deliveries_rx.recv() => {
                if let Some(session) = sessions.get_mut(&channel) {
                    send_transfer(&mut transport, channel, session, handle, delivery).await?;
                }
            }
            frame = transport.next() => {
                read_deadline = tokio::time::Instant::now() + receive_timeout;
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!("1.0 frame error: {}", e);
                        return close_connection(&mut transport, &e.to_string()).await;
                    }
                    None => return Ok(()),
                };

                match frame {
                    Frame::Empty { .. } => {} // peer heartbeat
                    Frame::Amqp { channel, performative, payload } => {
                        if !handle_performative(
                            &broker,
                            &mut transport,
                            &namespace,
                            &mut sessions,
                            &deliveries_tx,
                            channel,
                            performative,
                            payload,
                        )
                        .await?
                        {
                            return Ok(());
                        }
                    }
                    Frame::ProtocolHeader(_) | Frame::Sasl(_) => {
                        return close_connection(&mut transport, "unexpected frame").await;
                    }
                }
            }
        }
    }
}

/// Returns false when the connection is done.
#[allow(clippy::too_many_arguments)]
async fn handle_performative(
    broker: &Arc<Broker>,
    transport: &mut Transport,
    namespace: &str,
    sessions: &mut HashMap<u16, Session>,
    deliveries_tx: &mpsc::Sender<(u16, u32, WireDelivery)>,
    channel: u16,
    performative: Performative,
    payload: Bytes,
) -> Result<bool> {
    match performative {
        Performative::Open(_) => close_connection(transport, "duplicate open").await.map(|_| false),

        Performative::Begin(begin) => {
            if sessions.contains_key(&channel) {
                return close_connection(transport, "session already begun").await.map(|_| false);
            }
            let mut session = Session::new();
            session.next_incoming_id = begin.next_outgoing_id;
            sessions.insert(channel, session);
            send_performative(
                transport,
                channel,
                Performative::Begin(Begin {
                    remote_channel: Some(channel),
                    next_outgoing_id: 0,
                    incoming_window: SESSION_WINDOW,
                    outgoing_window: SESSION_WINDOW,
                    handle_max: None,
                }),
            )
            .await?;
            Ok(true)
        }

        Performative::End(_) => {
            if sessions.remove(&channel).is_none() {
                return close_connection(transport, "end for unknown session").await.map(|_| false);
            }
            send_performative(transport, channel, Performative::End(End { error: None })).await?;
            Ok(true)
        }

        Performative::Attach(attach) => {
            let Some(session) = sessions.get_mut(&channel) else {
                return close_connection(transport, "attach outside a session").await.map(|_| false);
            };
            handle_attach(transport, session, channel, attach).await?;
            Ok(true)
        }

        Performative::Detach(detach) => {
            let Some(session) = sessions.get_mut(&channel) else {
                return close_connection(transport, "detach outside a session").await.map(|_| false);
            };
            session.links.remove(&detach.handle);
            let was_ours = session.closing_links.remove(&detach.handle);
            if !was_ours {
                send_performative(
                    transport,
                    channel,
                    Performative::Detach(Detach {
                        handle: detach.handle,
                        closed: true,
                        error: None,
                    }),
                )
                .await?;
            }
            Ok(true)
        }

        Performative::Flow(flow) => {
            let Some(session) = sessions.get_mut(&channel) else {
                return close_connection(transport, "flow outside a session").await.map(|_| false);
            };
            handle_flow(broker, transport, session, channel, flow, deliveries_tx, namespace)
                .await?;
            Ok(true)
        }

        Performative::Transfer(transfer) => {
            let Some(session) = sessions.get_mut(&channel) else {
                return close_connection(transport, "transfer outside a session")
                    .await
                    .map(|_| false);
            };
            handle_transfer(broker, transport, namespace, session, channel, transfer, payload)
                .await?;
            Ok(true)
        }

        Performative::Disposition(disposition) => {
            let Some(session) = sessions.get_mut(&channel) else {
                return close_connection(transport, "disposition outside a session")
                    .await
                    .map(|_| false);
            };
            handle_disposition(broker, transport, session, channel, disposition).await?;
            Ok(true)
        }

        Performative::Close(_) => {
            send_performative(transport, 0, Performative::Close(Close { error: None })).await?;
            Ok(false)
        }
    }
}

async fn handle_attach(
    transport: &mut Transport,
    session: &mut Session,
    channel: u16,
    attach: Attach,
) -> Result<()> {
    if session.links.contains_key(&attach.handle) {
        return detach_with_error(
            transport,
            session,
            channel,
            attach.handle,
            "amqp:link:detach-forced",
            "handle already attached",
        )
        .await;
    }

    let (kind, reply) = if attach.role == ROLE_SENDER {
        // client sends to us: we mirror back as receiver
        let target = attach.target_address.clone().unwrap_or_default();
        let reply = Attach {
            name: attach.name.clone(),
            handle: attach.handle,
            role: ROLE_RECEIVER,
            source_address: attach.source_address.clone(),
            target_address: attach.target_address.clone(),
            initial_delivery_count: None,
        };
        (LinkKind::Receiver { target }, reply)
    } else {
        // client receives from us: subscription starts on the first flow
        let source = attach.source_address.clone().unwrap_or_default();
        let reply = Attach {
            name: attach.name.clone(),
            handle: attach.handle,
            role: ROLE_SENDER,
            source_address: attach.source_address.clone(),
            target_address: attach.target_address.clone(),
            initial_delivery_count: Some(0),
        };
        (
            LinkKind::Sender(SenderLink {
                task: None,
                source,
                delivery_count: 0,
                subscription: None,
            }),
            reply,
        )
    };

    debug!("link {:?} attached on handle {}", attach.name, attach.handle);
    session.links.insert(attach.handle, Link { kind });
    send_performative(transport, channel, Performative::Attach(reply)).await?;
    Ok(())
}

/// Flow on a sender link grants credit: start the subscription on the first
/// grant, then track the client's window. Session-level flows get our
/// windows echoed back.
#[allow(clippy::too_many_arguments)]
async fn handle_flow(
    broker: &Arc<Broker>,
    transport: &mut Transport,
    session: &mut Session,
    channel: u16,
    flow: Flow,
    deliveries_tx: &mpsc::Sender<(u16, u32, WireDelivery)>,
    namespace: &str,
) -> Result<()> {
    let Some(handle) = flow.handle else {
        session.next_incoming_id = flow.next_outgoing_id;
        send_performative(
            transport,
            channel,
            Performative::Flow(Flow {
                next_incoming_id: Some(session.next_incoming_id),
                incoming_window: SESSION_WINDOW,
                next_outgoing_id: session.next_outgoing_id,
                outgoing_window: SESSION_WINDOW,
                handle: None,
                delivery_count: None,
                link_credit: None,
                drain: false,
            }),
        )
        .await?;
        return Ok(());
    };
    let Some(link) = session.links.get_mut(&handle) else {
        return Ok(());
    };
    let LinkKind::Sender(sender) = &mut link.kind else {
        return Ok(());
    };

    let link_credit = flow.link_credit.unwrap_or(0);
    let client_delivery_count = flow.delivery_count.unwrap_or(0);
    let available = (client_delivery_count.wrapping_add(link_credit))
        .wrapping_sub(sender.delivery_count);

    let needs_subscribe =
        sender.subscription.is_none() && sender.task.is_none() && link_credit > 0;
    if needs_subscribe {
        let mut stream = match broker
            .subscribe(namespace, &sender.source, available, false)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                debug!("attach-time subscribe to {} failed: {}", sender.source, e);
                return Ok(());
            }
        };
        if let SubscriberStream::Local { subscription, .. } = &stream {
            sender.subscription = Some((subscription.id(), Arc::clone(subscription.group())));
        }
        let deliveries_tx = deliveries_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Ok(delivery) => {
                        if deliveries_tx.send((channel, handle, delivery)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
        sender.task = Some(task);
    } else if let Some((subscription_id, group)) = &sender.subscription {
        group.set_credit(*subscription_id, available);
    }
    Ok(())
}

async fn handle_transfer(
    broker: &Arc<Broker>,
    transport: &mut Transport,
    namespace: &str,
    session: &mut Session,
    channel: u16,
    transfer: Transfer,
    payload: Bytes,
) -> Result<()> {
    session.next_incoming_id = session.next_incoming_id.wrapping_add(1);

    let target = match session.links.get(&transfer.handle).map(|link| &link.kind) {
        Some(LinkKind::Receiver { target }) => target.clone(),
        Some(LinkKind::Sender(_)) => {
            return detach_with_error(
                transport,
                session,
                channel,
                transfer.handle,
                "amqp:link:detach-forced",
                "transfer on a sender link",
            )
            .await;
        }
        None => {
            return detach_with_error(
                transport,
                session,
                channel,
                transfer.handle,
                "amqp:link:detach-forced",
                "transfer on unattached handle",
            )
            .await;
        }
    };

    if transfer.more {
        return detach_with_error(
            transport,
            session,
            channel,
            transfer.handle,
            "amqp:not-implemented",
            "multi-frame transfers are not supported",
        )
        .await;
    }

    let message = match amqp1::decode_message(&payload) {
        Ok(message) => message,
        Err(e) => {
            return detach_with_error(
                transport,
                session,
                channel,
                transfer.handle,
                "amqp:decode-error",
                &e.to_string(),
            )
            .await;
        }
    };
    let mut message = message;
    if message.timestamp == 0 {
        message.timestamp = crate::protocol::now_millis();
    }

    let outcome = match broker.publish(namespace, &target, message).await {
        Ok(()) => DeliveryState::Accepted,
        Err(e) => {
            debug!("publish to {}/{} failed: {}", namespace, target, e);
            DeliveryState::Rejected(Some(AmqpError::with_description(
                "amqp:precondition-failed",
                e.to_string(),
            )))
        }
    };

    if transfer.settled != Some(true) {
        if let Some(delivery_id) = transfer.delivery_id {
            send_performative(
                transport,
                channel,
                Performative::Disposition(Disposition {
                    role: ROLE_RECEIVER,
                    first: delivery_id,
                    last: None,
                    settled: true,
                    state: Some(outcome),
                }),
            )
            .await?;
        }
    }
    Ok(())
}

/// Map a disposition range onto ack/nack for the deliveries it covers.
async fn handle_disposition(
    broker: &Arc<Broker>,
    transport: &mut Transport,
    session: &mut Session,
    channel: u16,
    disposition: Disposition,
) -> Result<()> {
    let first = disposition.first;
    let last = disposition.last.unwrap_or(first);

    for delivery_id in first..=last {
        let Some((node_id, subscription_id, seq_no)) = session.unsettled.remove(&delivery_id)
        else {
            continue;
        };
        let result = match &disposition.state {
            Some(DeliveryState::Accepted) | None => {
                broker.ack(node_id, subscription_id, seq_no).await
            }
            Some(DeliveryState::Released) => {
                broker.nack(node_id, subscription_id, seq_no, true).await
            }
            Some(DeliveryState::Rejected(_)) => {
                broker.nack(node_id, subscription_id, seq_no, false).await
            }
            Some(DeliveryState::Modified {
                undeliverable_here, ..
            }) => {
                broker
                    .nack(node_id, subscription_id, seq_no, !undeliverable_here)
                    .await
            }
        };
        if let Err(e) = result {
            debug!("disposition for delivery {} failed: {}", delivery_id, e);
        }
    }

    if !disposition.settled {
        send_performative(
            transport,
            channel,
            Performative::Disposition(Disposition {
                role: ROLE_SENDER,
                first,
                last: disposition.last,
                settled: true,
                state: disposition.state,
            }),
        )
        .await?;
    }
    Ok(())
}

async fn send_transfer(
    transport: &mut Transport,
    channel: u16,
    session: &mut Session,
    handle: u32,
    delivery: WireDelivery,
) -> Result<()> {
    let delivery_id = session.next_delivery_id;
    session.next_delivery_id = session.next_delivery_id.wrapping_add(1);
    session.next_outgoing_id = session.next_outgoing_id.wrapping_add(1);
    session.unsettled.insert(
        delivery_id,
        (delivery.node_id, delivery.subscription_id, delivery.seq_no),
    );
    if let Some(link) = session.links.get_mut(&handle) {
        if let LinkKind::Sender(sender) = &mut link.kind {
            sender.delivery_count = sender.delivery_count.wrapping_add(1);
        }
    }

    let payload = amqp1::encode_message(&delivery.message);
    transport
        .send(Frame::Amqp {
            channel,
            performative: Performative::Transfer(Transfer {
                handle,
                delivery_id: Some(delivery_id),
                delivery_tag: Some(Bytes::copy_from_slice(
                    &delivery_id.to_be_bytes(),
                )),
                message_format: Some(0),
                settled: Some(false),
                more: false,
            }),
            payload,
        })
        .await?;
    Ok(())
}

/// Close a link from our side; the peer's Detach echo is absorbed via
/// `closing_links`.
async fn detach_with_error(
    transport: &mut Transport,
    session: &mut Session,
    channel: u16,
    handle: u32,
    condition: &str,
    description: &str,
) -> Result<()> {
    session.links.remove(&handle);
    session.closing_links.insert(handle);
    send_performative(
        transport,
        channel,
        Performative::Detach(Detach {
            handle,
            closed: true,
            error: Some(AmqpError::with_description(condition, description)),
        }),
    )
    .await
}

async fn send_performative(
    transport: &mut Transport,
    channel: u16,
    performative: Performative,
) -> Result<()> {
    transport
        .send(Frame::Amqp {
            channel,
            performative,
            payload: Bytes::new(),
        })
        .await
        .map_err(|e| MeshmqError::Internal(e.to_string()))
}

async fn close_connection(transport: &mut Transport, reason: &str) -> Result<()> {
    send_performative(
        transport,
        0,
        Performative::Close(Close {
            error: Some(AmqpError::new(reason)),
        }),
    )
    .await
}

