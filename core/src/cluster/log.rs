//! Interface to the external replicated command log.
//!
//! The broker core never talks to consensus directly; it appends commands and
//! waits on the read-your-writes barrier through this trait. The in-process
//! [`LocalCommandLog`] backs single-node deployments and tests by applying
//! commands straight into the state store.

use super::store::ClusterStateStore;
use super::{Command, NodeId};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default bound on barrier waits.
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait CommandLog: Send + Sync {
    /// Append `cmd` to the ordered log and wait until it is applied locally.
    /// Returns the log index assigned to the command.
    async fn apply(&self, cmd: Command) -> Result<u64>;

    /// Read-your-writes fence: resolves once every command up to the caller's
    /// last submitted index has been applied locally.
    async fn barrier(&self, timeout: Duration) -> Result<()>;

    fn is_leader(&self) -> bool;

    /// Current leader, if one is elected.
    fn leader_id(&self) -> Option<NodeId>;
}

/// Single-node command log: applies synchronously into the local store.
pub struct LocalCommandLog {
    store: Arc<ClusterStateStore>,
    node_id: NodeId,
    next_index: AtomicU64,
}

impl LocalCommandLog {
    pub fn new(store: Arc<ClusterStateStore>, node_id: NodeId) -> Self {
        Self {
            store,
            node_id,
            next_index: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CommandLog for LocalCommandLog {
    async fn apply(&self, cmd: Command) -> Result<u64> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.apply(index, Some(&cmd));
        Ok(index)
    }

    async fn barrier(&self, _timeout: Duration) -> Result<()> {
        // applies are synchronous on a single node
        Ok(())
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_id(&self) -> Option<NodeId> {
        Some(self.node_id)
    }
}
