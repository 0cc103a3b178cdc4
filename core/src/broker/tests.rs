//! Broker end-to-end tests

use super::Broker;
use crate::cluster::log::{CommandLog, LocalCommandLog};
use crate::cluster::store::ClusterStateStore;
use crate::cluster::{
    Binding, BindingMatch, ClusterConsumerGroup, ClusterNode, ClusterTopic, Command, NodeId,
    NodeState, TopicKind,
};
use crate::config::BrokerConfig;
use crate::protocol::{FieldValue, Message};
use crate::{MeshmqError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Standalone broker with node 1 registered as alive; no listeners.
fn local_broker(dir: &tempfile::TempDir) -> Arc<Broker> {
    let store = Arc::new(ClusterStateStore::new());
    store.apply(
        1,
        Some(&Command::NodeUpdate {
            node: ClusterNode {
                id: 1,
                address: "127.0.0.1:1".to_string(),
                state: NodeState::Alive,
            },
        }),
    );
    let log: Arc<dyn CommandLog> = Arc::new(LocalCommandLog::new(Arc::clone(&store), 1));
    let config = BrokerConfig {
        node_id: 1,
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    Arc::new(Broker::with_command_log(config, store, log).unwrap())
}

fn topic(name: &str, kind: TopicKind) -> ClusterTopic {
    ClusterTopic {
        name: name.to_string(),
        kind,
        shards: 1,
        replication_factor: 1,
        retention: Duration::from_secs(3600),
    }
}

fn group(name: &str, bindings: Vec<Binding>) -> ClusterConsumerGroup {
    ClusterConsumerGroup {
        name: name.to_string(),
        size: 1024,
        since: 0,
        bindings,
        offset_commits: Vec::new(),
    }
}

fn message(routing_key: &str, body: &str) -> Message {
    Message {
        routing_key: routing_key.to_string(),
        body: body.as_bytes().to_vec().into(),
        timestamp: crate::protocol::now_millis(),
        ..Default::default()
    }
}

#[tokio::test]
async fn fanout_publish_subscribe_ack_commits_offset() {
    let dir = tempdir().unwrap();
    let broker = local_broker(&dir);

    broker
        .create_topic("default", topic("t", TopicKind::Fanout), false)
        .await
        .unwrap();
    broker
        .create_consumer_group(
            "default",
            group(
                "g",
                vec![Binding {
                    topic_name: "t".to_string(),
                    by: BindingMatch::Fanout,
                }],
            ),
            false,
        )
        .await
        .unwrap();

    broker
        .publish("default", "t", message("any", "m1"))
        .await
        .unwrap();

    let mut stream = broker.subscribe("default", "g", 4, false).await.unwrap();
    let delivery = stream.next().await.unwrap();
    assert_eq!(delivery.message.body.as_ref(), b"m1");
    assert_eq!(delivery.topic, "t");

    broker
        .ack(delivery.node_id, delivery.subscription_id, delivery.seq_no)
        .await
        .unwrap();

    // the coalesced offset-commit command lands shortly after the ack
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let state = broker.state().current();
        let committed = state
            .find_consumer_group("default", "g")
            .map(|g| g.offset_commits.clone())
            .unwrap_or_default();
        if committed.iter().any(|c| c.offset == 1) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "offset commit did not advance: {:?}",
            committed
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn direct_topic_routes_on_exact_key_only() {
    let dir = tempdir().unwrap();
    let broker = local_broker(&dir);

    broker
        .create_topic("default", topic("t", TopicKind::Direct), false)
        .await
        .unwrap();
    broker
        .create_consumer_group(
            "default",
            group(
                "g",
                vec![Binding {
                    topic_name: "t".to_string(),
                    by: BindingMatch::RoutingKey("rk".to_string()),
                }],
            ),
            false,
        )
        .await
        .unwrap();

    broker
        .publish("default", "t", message("other", "skipped"))
        .await
        .unwrap();
    broker
        .publish("default", "t", message("rk", "wanted"))
        .await
        .unwrap();

    let mut stream = broker.subscribe("default", "g", 4, false).await.unwrap();
    let delivery = stream.next().await.unwrap();
    assert_eq!(delivery.message.body.as_ref(), b"wanted");

    let nothing = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(nothing.is_err(), "unmatched message must not be delivered");
}

#[tokio::test]
async fn headers_all_binding_requires_every_header() {
    let dir = tempdir().unwrap();
    let broker = local_broker(&dir);

    broker
        .create_topic("default", topic("t", TopicKind::Headers), false)
        .await
        .unwrap();
    broker
        .create_consumer_group(
            "default",
            group(
                "g",
                vec![Binding {
                    topic_name: "t".to_string(),
                    by: BindingMatch::HeadersAll(
                        [
                            ("x".to_string(), FieldValue::I32(1)),
                            ("y".to_string(), FieldValue::I32(2)),
                        ]
                        .into(),
                    ),
                }],
            ),
            false,
        )
        .await
        .unwrap();

    let mut partial = message("", "partial");
    partial.headers = [("x".to_string(), FieldValue::I32(1))].into();
    broker.publish("default", "t", partial).await.unwrap();

    let mut full = message("", "full");
    full.headers = [
        ("x".to_string(), FieldValue::I32(1)),
        ("y".to_string(), FieldValue::I32(2)),
        ("z".to_string(), FieldValue::I32(3)),
    ]
    .into();
    broker.publish("default", "t", full).await.unwrap();

    let mut stream = broker.subscribe("default", "g", 4, false).await.unwrap();
    let delivery = stream.next().await.unwrap();
    assert_eq!(delivery.message.body.as_ref(), b"full");
}

#[tokio::test]
async fn deleted_group_stops_delivering_and_acks_are_noops() {
    let dir = tempdir().unwrap();
    let broker = local_broker(&dir);

    broker
        .create_topic("default", topic("t", TopicKind::Fanout), false)
        .await
        .unwrap();
    broker
        .create_consumer_group(
            "default",
            group(
                "g",
                vec![Binding {
                    topic_name: "t".to_string(),
                    by: BindingMatch::Fanout,
                }],
            ),
            false,
        )
        .await
        .unwrap();
    broker
        .publish("default", "t", message("k", "m"))
        .await
        .unwrap();

    let mut stream = broker.subscribe("default", "g", 4, false).await.unwrap();
    let delivery = stream.next().await.unwrap();

    broker
        .delete_consumer_group("default", "g", false)
        .await
        .unwrap();

    // the subscription wakes with closed, later acks are no-ops
    let next = stream.next().await;
    assert!(matches!(next, Err(MeshmqError::SubscriptionClosed)));
    broker
        .ack(delivery.node_id, delivery.subscription_id, delivery.seq_no)
        .await
        .unwrap();
}

// ---- leader/follower forwarding ----

struct FollowerLog {
    leader: NodeId,
}

#[async_trait]
impl CommandLog for FollowerLog {
    async fn apply(&self, _cmd: Command) -> Result<u64> {
        Err(MeshmqError::NotLeader)
    }

    async fn barrier(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn is_leader(&self) -> bool {
        false
    }

    fn leader_id(&self) -> Option<NodeId> {
        Some(self.leader)
    }
}

async fn start_leader(dir: &tempfile::TempDir) -> (Arc<Broker>, u16, u16) {
    let port = free_port();
    let rpc_port = free_port();
    let config = BrokerConfig {
        bind_host: "127.0.0.1".to_string(),
        port,
        rpc_port,
        node_id: 1,
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let broker = Arc::new(Broker::new(config).unwrap());
    tokio::spawn(Arc::clone(&broker).run());

    // wait for the listeners to come up
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return (broker, port, rpc_port);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("leader did not start");
}

#[tokio::test]
async fn follower_forwards_to_leader_unless_flagged() {
    let leader_dir = tempdir().unwrap();
    let (leader, _port, rpc_port) = start_leader(&leader_dir).await;

    let follower_dir = tempdir().unwrap();
    let store = Arc::new(ClusterStateStore::new());
    store.apply(
        1,
        Some(&Command::NodeUpdate {
            node: ClusterNode {
                id: 1,
                address: format!("127.0.0.1:{}", rpc_port),
                state: NodeState::Alive,
            },
        }),
    );
    let config = BrokerConfig {
        node_id: 2,
        data_dir: follower_dir.path().to_path_buf(),
        ..Default::default()
    };
    let follower = Arc::new(
        Broker::with_command_log(config, store, Arc::new(FollowerLog { leader: 1 })).unwrap(),
    );

    // leader-only on a follower fails without forwarding
    let denied = follower
        .create_topic("default", topic("t", TopicKind::Fanout), true)
        .await;
    assert!(matches!(denied, Err(MeshmqError::NotLeader)));

    // unflagged call forwards and succeeds on the leader
    follower
        .create_topic("default", topic("t", TopicKind::Fanout), false)
        .await
        .unwrap();
    assert!(leader.state().current().get_topic("default", "t").is_some());

    leader.shutdown();
}

// ---- wire-level sessions ----

mod wire {
    use super::*;
    use crate::protocol::amqp0::{self, Amqp0Codec, Frame as Frame0, Method};
    use crate::protocol::amqp1::{
        Amqp1Codec, Close, Frame as Frame1, Open, Performative, ProtocolId,
    };
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn amqp1_rejects_short_idle_timeout() {
        let dir = tempdir().unwrap();
        let (broker, port, _) = start_leader(&dir).await;

        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let mut client = Framed::new(stream, Amqp1Codec::new());

        client
            .send(Frame1::ProtocolHeader(ProtocolId::Amqp))
            .await
            .unwrap();
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Frame1::ProtocolHeader(ProtocolId::Amqp)
        ));

        client
            .send(Frame1::Amqp {
                channel: 0,
                performative: Performative::Open(Open {
                    container_id: "client".to_string(),
                    idle_timeout: Some(500),
                    ..Default::default()
                }),
                payload: bytes::Bytes::new(),
            })
            .await
            .unwrap();

        // server replies with its open, then closes with a descriptive error
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Frame1::Amqp {
                performative: Performative::Open(_),
                ..
            }
        ));
        match client.next().await.unwrap().unwrap() {
            Frame1::Amqp {
                performative: Performative::Close(Close { error: Some(e) }),
                ..
            } => assert_eq!(e.condition, "client timeout too short"),
            other => panic!("expected close, got {:?}", other),
        }

        broker.shutdown();
    }

    #[tokio::test]
    async fn amqp0_duplicate_channel_open_is_a_channel_error() {
        let dir = tempdir().unwrap();
        let (broker, port, _) = start_leader(&dir).await;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream.write_all(&amqp0::PROTOCOL_HEADER).await.unwrap();
        let mut client = Framed::new(stream, Amqp0Codec::new());

        // handshake
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Frame0::Method {
                method: Method::ConnectionStart { .. },
                ..
            }
        ));
        client
            .send(Frame0::Method {
                channel: 0,
                method: Method::ConnectionStartOk {
                    client_properties: Default::default(),
                    mechanism: "PLAIN".to_string(),
                    response: bytes::Bytes::from_static(b"\0guest\0guest"),
                    locale: "en_US".to_string(),
                },
            })
            .await
            .unwrap();
        let Frame0::Method {
            method:
                Method::ConnectionTune {
                    channel_max,
                    frame_max,
                    heartbeat,
                },
            ..
        } = client.next().await.unwrap().unwrap()
        else {
            panic!("expected tune");
        };
        client
            .send(Frame0::Method {
                channel: 0,
                method: Method::ConnectionTuneOk {
                    channel_max,
                    frame_max,
                    heartbeat,
                },
            })
            .await
            .unwrap();
        client
            .send(Frame0::Method {
                channel: 0,
                method: Method::ConnectionOpen {
                    virtual_host: "/".to_string(),
                },
            })
            .await
            .unwrap();
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Frame0::Method {
                method: Method::ConnectionOpenOk,
                ..
            }
        ));

        // first channel.open succeeds, the duplicate forces the connection
        // closed with channel-error
        client
            .send(Frame0::Method {
                channel: 1,
                method: Method::ChannelOpen,
            })
            .await
            .unwrap();
        assert!(matches!(
            client.next().await.unwrap().unwrap(),
            Frame0::Method {
                method: Method::ChannelOpenOk,
                ..
            }
        ));
        client
            .send(Frame0::Method {
                channel: 1,
                method: Method::ChannelOpen,
            })
            .await
            .unwrap();

        loop {
            match client.next().await.unwrap().unwrap() {
                Frame0::Method {
                    method: Method::ConnectionClose { reply_code, .. },
                    ..
                } => {
                    assert_eq!(reply_code, amqp0::CHANNEL_ERROR);
                    break;
                }
                Frame0::Heartbeat { .. } => continue,
                other => panic!("expected connection.close, got {:?}", other),
            }
        }

        broker.shutdown();
    }
}
