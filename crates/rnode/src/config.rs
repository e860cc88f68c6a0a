//! Node configuration.
//!
//! Every field has a serde default so a partial TOML file (or an empty one)
//! produces a usable configuration.

use std::path::Path;
use std::time::Duration;

use rnode_verbs::ConnParam;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Listen backlog used for the node's root id.
pub const LISTEN_BACKLOG: i32 = 128;

/// Configuration for an [`RdmaNode`](crate::RdmaNode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Port to bind. 0 lets the fabric pick one.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of bind attempts; the port is incremented after each failure
    /// unless it is 0.
    #[serde(default = "default_port_max_retries")]
    pub port_max_retries: u32,

    /// Accept-loop poll timeout. Bounds how long `stop` waits for the
    /// accept thread to notice it should exit.
    #[serde(default = "default_teardown_listen_timeout_ms")]
    pub teardown_listen_timeout_ms: u64,

    /// Timeout for each CM event of a connection attempt.
    #[serde(default = "default_rdma_cm_event_timeout_ms")]
    pub rdma_cm_event_timeout_ms: u64,

    #[serde(default = "default_max_connection_attempts")]
    pub max_connection_attempts: u32,

    /// Upper bound on threads used to stop channels in parallel.
    #[serde(default = "default_shutdown_workers")]
    pub shutdown_workers: usize,

    /// Listen backlog. Fixed; deserialized values are ignored.
    #[serde(default = "default_listen_backlog", skip_deserializing)]
    pub listen_backlog: i32,

    #[serde(default = "default_one")]
    pub responder_resources: u8,

    #[serde(default = "default_one")]
    pub initiator_depth: u8,

    #[serde(default = "default_seven")]
    pub retry_count: u8,

    /// RNR retry count (7 = infinite).
    #[serde(default = "default_seven")]
    pub rnr_retry_count: u8,

    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: u32,

    #[serde(default = "default_recv_queue_depth")]
    pub recv_queue_depth: u32,

    /// Smallest registered buffer handed out by the buffer manager.
    #[serde(default = "default_min_buffer_size")]
    pub min_buffer_size: usize,

    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Buffers kept per size class for reuse.
    #[serde(default = "default_buffer_pool_capacity")]
    pub buffer_pool_capacity: usize,
}

fn default_port() -> u16 {
    1955
}
fn default_port_max_retries() -> u32 {
    16
}
fn default_teardown_listen_timeout_ms() -> u64 {
    50
}
fn default_rdma_cm_event_timeout_ms() -> u64 {
    20_000
}
fn default_max_connection_attempts() -> u32 {
    5
}
fn default_shutdown_workers() -> usize {
    8
}
fn default_listen_backlog() -> i32 {
    LISTEN_BACKLOG
}
fn default_one() -> u8 {
    1
}
fn default_seven() -> u8 {
    7
}
fn default_send_queue_depth() -> u32 {
    4096
}
fn default_recv_queue_depth() -> u32 {
    256
}
fn default_min_buffer_size() -> usize {
    4096
}
fn default_max_buffer_size() -> usize {
    64 * 1024 * 1024
}
fn default_buffer_pool_capacity() -> usize {
    256
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            port_max_retries: default_port_max_retries(),
            teardown_listen_timeout_ms: default_teardown_listen_timeout_ms(),
            rdma_cm_event_timeout_ms: default_rdma_cm_event_timeout_ms(),
            max_connection_attempts: default_max_connection_attempts(),
            shutdown_workers: default_shutdown_workers(),
            listen_backlog: default_listen_backlog(),
            responder_resources: default_one(),
            initiator_depth: default_one(),
            retry_count: default_seven(),
            rnr_retry_count: default_seven(),
            send_queue_depth: default_send_queue_depth(),
            recv_queue_depth: default_recv_queue_depth(),
            min_buffer_size: default_min_buffer_size(),
            max_buffer_size: default_max_buffer_size(),
            buffer_pool_capacity: default_buffer_pool_capacity(),
        }
    }
}

impl NodeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn at_least(field: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
            if value < min {
                return Err(ConfigError::OutOfRange { field, value, min });
            }
            Ok(())
        }

        at_least("port_max_retries", self.port_max_retries.into(), 1)?;
        at_least("teardown_listen_timeout_ms", self.teardown_listen_timeout_ms, 1)?;
        at_least("rdma_cm_event_timeout_ms", self.rdma_cm_event_timeout_ms, 1)?;
        at_least("max_connection_attempts", self.max_connection_attempts.into(), 1)?;
        at_least("shutdown_workers", self.shutdown_workers as u64, 1)?;
        at_least("min_buffer_size", self.min_buffer_size as u64, 1)?;
        at_least(
            "max_buffer_size",
            self.max_buffer_size as u64,
            self.min_buffer_size as u64,
        )?;
        Ok(())
    }

    pub fn teardown_listen_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_listen_timeout_ms)
    }

    pub fn cm_event_timeout(&self) -> Duration {
        Duration::from_millis(self.rdma_cm_event_timeout_ms)
    }

    /// Overall budget of one acquisition: attempts × per-attempt timeout.
    pub fn connection_deadline(&self) -> Duration {
        self.cm_event_timeout() * self.max_connection_attempts
    }

    pub fn conn_param(&self) -> ConnParam {
        ConnParam {
            responder_resources: self.responder_resources,
            initiator_depth: self.initiator_depth,
            retry_count: self.retry_count,
            rnr_retry_count: self.rnr_retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 1955);
        assert_eq!(config.port_max_retries, 16);
        assert_eq!(config.listen_backlog, 128);
        assert_eq!(config.teardown_listen_timeout(), Duration::from_millis(50));
        assert_eq!(config.connection_deadline(), Duration::from_secs(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            port = 0
            max_connection_attempts = 3
            rdma_cm_event_timeout_ms = 200
            listen_backlog = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.connection_deadline(), Duration::from_millis(600));
        assert_eq!(config.listen_backlog, LISTEN_BACKLOG);
        assert_eq!(config.port_max_retries, 16);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let err = NodeConfig::from_toml_str("max_connection_attempts = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "max_connection_attempts",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_buffer_sizes() {
        let config = NodeConfig {
            min_buffer_size: 8192,
            max_buffer_size: 4096,
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "max_buffer_size",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            NodeConfig::from_toml_str("port = \"high\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = NodeConfig::load("/nonexistent/rnode.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("rnode-config-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7000\nshutdown_workers = 2\n").unwrap();
        let config = NodeConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.shutdown_workers, 2);
    }

    #[test]
    fn test_conn_param() {
        let config = NodeConfig {
            responder_resources: 4,
            ..NodeConfig::default()
        };
        let param = config.conn_param();
        assert_eq!(param.responder_resources, 4);
        assert_eq!(param.rnr_retry_count, 7);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = NodeConfig {
            port: 0,
            ..NodeConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
