//! Bounded per-peer connection pool for node RPC.

use super::rpc::{connect_framed, RpcConn};
use crate::{MeshmqError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

struct IdleConn {
    conn: RpcConn,
    since: Instant,
}

#[derive(Default)]
struct PeerEntry {
    idle: Vec<IdleConn>,
}

pub struct NodePool {
    max_per_peer: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
    peers: Mutex<HashMap<String, PeerEntry>>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// A connection checked out of the pool. Return it with [`NodePool::put`];
/// dropping it instead discards the connection but frees the slot.
pub struct PooledConn {
    pub conn: RpcConn,
    addr: String,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl NodePool {
    pub fn new(max_per_peer: usize, idle_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            max_per_peer,
            idle_timeout,
            connect_timeout,
            peers: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
        }
    }

    fn limit_for(&self, addr: &str) -> Arc<Semaphore> {
        let mut limits = self.limits.lock();
        Arc::clone(
            limits
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_peer))),
        )
    }

    /// Check a connection out, reusing an idle one when possible. Honors
    /// `deadline` across both slot acquisition and dialing.
    pub async fn get(&self, addr: &str, deadline: Duration) -> Result<PooledConn> {
        let started = Instant::now();
        let limit = self.limit_for(addr);
        let permit = tokio::time::timeout(deadline, limit.acquire_owned())
            .await
            .map_err(|_| MeshmqError::Timeout)?
            .map_err(|_| MeshmqError::Shutdown)?;

        // reuse a live idle connection
        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(addr) {
                while let Some(idle) = entry.idle.pop() {
                    if idle.since.elapsed() < self.idle_timeout {
                        debug!("reusing pooled connection to {}", addr);
                        return Ok(PooledConn {
                            conn: idle.conn,
                            addr: addr.to_string(),
                            _permit: permit,
                        });
                    }
                    // expired; drop and keep looking
                }
            }
        }

        let remaining = deadline
            .checked_sub(started.elapsed())
            .unwrap_or(Duration::ZERO)
            .min(self.connect_timeout);
        let stream = tokio::time::timeout(remaining, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshmqError::Timeout)??;
        stream.set_nodelay(true)?;

        Ok(PooledConn {
            conn: connect_framed(stream),
            addr: addr.to_string(),
            _permit: permit,
        })
    }

    /// Return a healthy connection for reuse.
    pub fn put(&self, pooled: PooledConn) {
        let mut peers = self.peers.lock();
        let entry = peers.entry(pooled.addr.clone()).or_default();
        if entry.idle.len() < self.max_per_peer {
            entry.idle.push(IdleConn {
                conn: pooled.conn,
                since: Instant::now(),
            });
        }
        // permit drops here, freeing the slot either way
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pool_reuses_idle_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = NodePool::new(2, Duration::from_secs(60), Duration::from_secs(1));
        let first = pool.get(&addr, Duration::from_secs(1)).await.unwrap();
        pool.put(first);

        let second = pool.get(&addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.addr(), addr);
        assert_eq!(pool.peers.lock().get(&addr).unwrap().idle.len(), 0);
    }

    #[tokio::test]
    async fn pool_bounds_connections_per_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = NodePool::new(1, Duration::from_secs(60), Duration::from_secs(1));
        let held = pool.get(&addr, Duration::from_secs(1)).await.unwrap();

        // second acquire times out while the only slot is held
        let denied = pool.get(&addr, Duration::from_millis(50)).await;
        assert!(matches!(denied, Err(MeshmqError::Timeout)));

        drop(held);
        assert!(pool.get(&addr, Duration::from_secs(1)).await.is_ok());
    }
}
