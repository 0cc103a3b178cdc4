//! # Broker
//!
//! Ties the subsystems together: the cluster state store and command log,
//! segment coordination and reconciliation, local segment storage, the
//! consumer-group runtimes, the node RPC surface, and the two AMQP
//! listeners.

pub mod amqp0;
pub mod amqp1;
pub mod ops;
pub mod pool;
pub mod rpc;

#[cfg(test)]
mod tests;

use crate::cluster::log::{CommandLog, LocalCommandLog};
use crate::cluster::reconciler::Reconciler;
use crate::cluster::segments::SegmentCoordinator;
use crate::cluster::store::ClusterStateStore;
use crate::cluster::{ClusterNode, Command, NodeId, NodeState, SegmentKind};
use crate::config::BrokerConfig;
use crate::consumers::group::CommitHook;
use crate::consumers::{ConsumerGroup, Subscription, SubscriptionId};
use crate::protocol::sasl::{PlainProvider, Provider};
use crate::protocol::NamespaceName;
use crate::storage::{SegmentStore, SegmentStoreConfig};
use crate::{MeshmqError, Result};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use pool::NodePool;
use rpc::{Response, RpcConn, WireDelivery};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const GROUP_SYNC_INTERVAL: Duration = Duration::from_secs(1);

pub struct Broker {
    config: BrokerConfig,
    state: Arc<ClusterStateStore>,
    log: Arc<dyn CommandLog>,
    coordinator: Arc<SegmentCoordinator>,
    reconciler: Arc<Reconciler>,
    storage: Arc<SegmentStore>,
    pool: NodePool,
    sasl: Arc<dyn Provider>,
    /// Running consumer-group runtimes, keyed by `namespace/name`. The lock
    /// is held only around map mutation.
    groups: Mutex<HashMap<String, Arc<ConsumerGroup>>>,
    /// Routes acknowledgements to the owning group runtime.
    subscriptions: DashMap<SubscriptionId, Arc<ConsumerGroup>>,
    subscription_ids: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Broker {
    /// Standalone broker backed by the in-process single-node command log.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let store = Arc::new(ClusterStateStore::new());
        let log: Arc<dyn CommandLog> =
            Arc::new(LocalCommandLog::new(Arc::clone(&store), config.node_id));
        Self::with_command_log(config, store, log)
    }

    /// Broker wired to an external replicated command log. The store must be
    /// the projection that log applies into.
    pub fn with_command_log(
        config: BrokerConfig,
        state: Arc<ClusterStateStore>,
        log: Arc<dyn CommandLog>,
    ) -> Result<Self> {
        config.validate().map_err(MeshmqError::Validation)?;

        let storage = Arc::new(SegmentStore::new(SegmentStoreConfig {
            data_dir: config.data_dir.clone(),
            dir_perm: config.dir_perm,
            max_segment_size: config.segment_size,
        })?);
        let coordinator = Arc::new(SegmentCoordinator::new(Arc::clone(&state), Arc::clone(&log)));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&state),
            Arc::clone(&log),
            Arc::clone(&coordinator),
        ));
        let pool = NodePool::new(
            config.pool_max_per_peer,
            Duration::from_millis(config.pool_idle_timeout_ms),
            Duration::from_secs(5),
        );
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            state,
            log,
            coordinator,
            reconciler,
            storage,
            pool,
            sasl: Arc::new(PlainProvider::permissive()),
            groups: Mutex::new(HashMap::new()),
            subscriptions: DashMap::new(),
            subscription_ids: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
        })
    }

    /// Swap the SASL credential provider (defaults to accept-everything).
    pub fn with_sasl_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.sasl = provider;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn state(&self) -> &Arc<ClusterStateStore> {
        &self.state
    }

    pub(crate) fn sasl(&self) -> &Arc<dyn Provider> {
        &self.sasl
    }

    pub(crate) fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.config.barrier_timeout_ms)
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown: sessions send close frames, background
    /// loops stop, blocked operations are cancelled.
    pub fn shutdown(&self) {
        info!("initiating graceful shutdown");
        let _ = self.shutdown_tx.send(());
        let groups: Vec<_> = self.groups.lock().values().cloned().collect();
        for group in groups {
            group.close();
        }
    }

    /// Serve AMQP and node RPC until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // announce this node in the catalog
        if self.log.is_leader() {
            self.log
                .apply(Command::NodeUpdate {
                    node: ClusterNode {
                        id: self.config.node_id,
                        address: self.config.advertised_rpc_address(),
                        state: NodeState::Alive,
                    },
                })
                .await?;
        }

        let rpc_listener = TcpListener::bind((
            self.config.bind_host.as_str(),
            self.config.rpc_port(),
        ))
        .await?;
        tokio::spawn(rpc::serve(Arc::clone(&self), rpc_listener));

        tokio::spawn(
            Arc::clone(&self.reconciler).run(self.subscribe_shutdown()),
        );
        tokio::spawn(Arc::clone(&self).run_group_sync());

        let listener =
            TcpListener::bind((self.config.bind_host.as_str(), self.config.port)).await?;
        info!(
            "meshmq node {} listening on {}:{}",
            self.config.node_id, self.config.bind_host, self.config.port
        );

        let mut shutdown = self.subscribe_shutdown();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("client connection from {}", addr);
                        let broker = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = broker.serve_client(stream).await {
                                debug!("connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// Read the protocol preamble and hand the connection to the right
    /// session handler.
    async fn serve_client(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;

        if header == crate::protocol::amqp0::PROTOCOL_HEADER {
            amqp0::serve(self, stream).await
        } else if header == crate::protocol::amqp1::PROTO_HEADER_SASL
            || header == crate::protocol::amqp1::PROTO_HEADER_AMQP
        {
            amqp1::serve(self, stream, header).await
        } else {
            // unsupported protocol: answer with the version we speak
            use tokio::io::AsyncWriteExt;
            stream
                .write_all(&crate::protocol::amqp0::PROTOCOL_HEADER)
                .await?;
            Ok(())
        }
    }

    /// Background loop keeping local group runtimes aligned with the
    /// catalog.
    async fn run_group_sync(self: Arc<Self>) {
        let mut shutdown = self.subscribe_shutdown();
        let mut interval = tokio::time::interval(GROUP_SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => self.sync_groups(),
            }
        }
    }

    /// Start runtimes for groups whose offset-commits segment this node is
    /// primary for; tear down the rest.
    pub fn sync_groups(self: &Arc<Self>) {
        let state = self.state.current();
        let mut desired: HashMap<String, (NamespaceName, u32, Vec<crate::cluster::OffsetCommit>)> =
            HashMap::new();

        for namespace in &state.namespaces {
            for group in &namespace.consumer_groups {
                let owner = NamespaceName::new(&namespace.name, &group.name);
                let primary = state
                    .open_segments_for(SegmentKind::ConsumerGroupOffsetCommits, &owner)
                    .first()
                    .map(|s| s.nodes.primary_node_id);
                if primary == Some(self.config.node_id) {
                    desired.insert(
                        owner.to_string(),
                        (owner, group.size, group.offset_commits.clone()),
                    );
                }
            }
        }

        let mut to_close = Vec::new();
        let mut to_start = Vec::new();
        {
            let mut groups = self.groups.lock();
            groups.retain(|key, group| {
                if desired.contains_key(key) {
                    true
                } else {
                    to_close.push(Arc::clone(group));
                    false
                }
            });
            for (key, (owner, size, offset_commits)) in desired {
                if groups.contains_key(&key) {
                    continue;
                }
                let group = Arc::new(ConsumerGroup::new(
                    owner.clone(),
                    size,
                    Arc::clone(&self.subscription_ids),
                ));
                for commit in &offset_commits {
                    group.restore_offset(commit.segment_id, commit.offset);
                }
                groups.insert(key, Arc::clone(&group));
                to_start.push((owner, group));
            }
        }

        for group in to_close {
            info!("stopping consumer group runtime {}", group.name());
            group.close();
        }
        for (owner, group) in to_start {
            info!("starting consumer group runtime {}", owner);
            let hook = self.commit_hook(owner);
            tokio::spawn(Arc::clone(&group).run_commits(hook));
        }
    }

    fn commit_hook(self: &Arc<Self>, owner: NamespaceName) -> CommitHook {
        let broker = Arc::downgrade(self);
        Arc::new(move |commits| -> crate::consumers::group::CommitFuture {
            let broker = broker.clone();
            let owner = owner.clone();
            Box::pin(async move {
                let Some(broker) = broker.upgrade() else {
                    return Err(MeshmqError::Shutdown);
                };
                broker
                    .update_offset_commits(&owner.namespace, &owner.name, commits, false)
                    .await
                    .map(|_| ())
            })
        })
    }

    pub(crate) fn find_group(&self, namespace: &str, name: &str) -> Option<Arc<ConsumerGroup>> {
        self.groups
            .lock()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }
}

/// A subscription as seen by protocol sessions: local runtime or a stream
/// forwarded from the group's primary node.
pub enum SubscriberStream {
    Local {
        subscription: Subscription,
        node_id: NodeId,
        broker: Arc<Broker>,
    },
    Remote {
        conn: RpcConn,
    },
}

impl SubscriberStream {
    /// Next delivery; fails with subscription-closed when the stream ends.
    pub async fn next(&mut self) -> Result<WireDelivery> {
        match self {
            SubscriberStream::Local {
                subscription,
                node_id,
                ..
            } => {
                let delivery = subscription.next().await?;
                Ok(WireDelivery {
                    topic: delivery.topic,
                    message: delivery.message,
                    node_id: *node_id,
                    subscription_id: subscription.id(),
                    seq_no: delivery.seq_no,
                })
            }
            SubscriberStream::Remote { conn } => match conn.next().await {
                Some(Ok(frame)) => match bincode::deserialize(&frame)? {
                    Response::Delivery(delivery) => Ok(delivery),
                    Response::Error { code, message } => Err(Response::into_error(code, message)),
                    other => Err(MeshmqError::Internal(format!(
                        "unexpected subscribe response: {:?}",
                        other
                    ))),
                },
                Some(Err(e)) => Err(e.into()),
                None => Err(MeshmqError::SubscriptionClosed),
            },
        }
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        if let SubscriberStream::Local {
            subscription,
            broker,
            ..
        } = self
        {
            broker.subscriptions.remove(&subscription.id());
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("node_id", &self.config.node_id)
            .finish_non_exhaustive()
    }
}
