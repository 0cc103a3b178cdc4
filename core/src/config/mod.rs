use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-wide broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address the AMQP listener binds to.
    pub bind_host: String,
    pub port: u16,
    /// Address peers use to reach this node; defaults to `bind_host`.
    pub advertise_host: String,
    /// Node RPC listener port. Zero means `port + 1`.
    pub rpc_port: u16,
    /// Stable, non-zero node identifier.
    pub node_id: u64,
    pub data_dir: PathBuf,
    /// Permission bits for created data directories.
    pub dir_perm: u32,
    /// Peers to join on startup, as host:port.
    pub join_peers: Vec<String>,
    /// Size threshold at which topic segments rotate.
    pub segment_size: u64,
    /// Bound on replicated-log barrier waits, milliseconds.
    pub barrier_timeout_ms: u64,
    /// Idle timeout for pooled peer connections, milliseconds.
    pub pool_idle_timeout_ms: u64,
    /// Maximum pooled connections per peer.
    pub pool_max_per_peer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            advertise_host: String::new(),
            port: 5672,
            rpc_port: 0,
            node_id: 1,
            data_dir: PathBuf::from("./data"),
            dir_perm: 0o755,
            join_peers: Vec::new(),
            segment_size: 64 * 1024 * 1024,
            barrier_timeout_ms: 10_000,
            pool_idle_timeout_ms: 60_000,
            pool_max_per_peer: 8,
        }
    }
}

impl BrokerConfig {
    pub fn advertise_host(&self) -> &str {
        if self.advertise_host.is_empty() {
            &self.bind_host
        } else {
            &self.advertise_host
        }
    }

    pub fn rpc_port(&self) -> u16 {
        if self.rpc_port == 0 {
            self.port + 1
        } else {
            self.rpc_port
        }
    }

    /// Address peers dial for node RPC.
    pub fn advertised_rpc_address(&self) -> String {
        format!("{}:{}", self.advertise_host(), self.rpc_port())
    }

    /// Validate configuration bounds before startup.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.node_id == 0 {
            return Err("node_id must be non-zero".to_string());
        }
        if self.port == 0 {
            return Err("port must be > 0".to_string());
        }
        if self.segment_size == 0 {
            return Err("segment_size must be > 0".to_string());
        }
        if self.pool_max_per_peer == 0 {
            return Err("pool_max_per_peer must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_node_id_is_rejected() {
        let config = BrokerConfig {
            node_id: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn rpc_port_defaults_to_port_plus_one() {
        let config = BrokerConfig {
            port: 5672,
            ..Default::default()
        };
        assert_eq!(config.rpc_port(), 5673);
    }
}
