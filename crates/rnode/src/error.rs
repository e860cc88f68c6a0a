use std::net::SocketAddr;
use std::path::PathBuf;

use rnode_verbs::{CmEventType, VerbsError};
use thiserror::Error;

/// Errors raised by a single transport channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("verbs error: {0}")]
    Verbs(#[from] VerbsError),

    /// No CM event arrived within the per-attempt timeout.
    #[error("timed out waiting for {0}")]
    Timeout(CmEventType),

    /// A different CM event arrived than the one the handshake expected.
    #[error("expected {expected}, got {got}")]
    UnexpectedEvent {
        expected: CmEventType,
        got: CmEventType,
    },

    #[error("invalid channel state: {0}")]
    InvalidState(String),

    /// `accept` was called on a channel that was not created for an
    /// incoming request.
    #[error("channel has no passive id to accept")]
    NotPassive,

    #[error("channel stopped")]
    Stopped,
}

/// Errors loading or validating a [`NodeConfig`](crate::NodeConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} = {value} is out of range (min {min})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
    },
}

/// Errors from the registered-buffer manager.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("memory registration failed: {0}")]
    Register(#[from] VerbsError),

    #[error("requested {requested} bytes, max buffer size is {max}")]
    TooLarge { requested: usize, max: usize },

    #[error("buffer manager stopped")]
    Stopped,
}

/// Errors surfaced by [`RdmaNode`](crate::RdmaNode).
#[derive(Debug, Error)]
pub enum NodeError {
    /// The native RDMA library could not be loaded. Nothing was acquired.
    #[error("native RDMA binding not available: {0}")]
    NativeBindingMissing(String),

    #[error("unable to allocate RDMA event channel: {0}")]
    EventChannel(#[source] VerbsError),

    #[error("unable to allocate RDMA CM id: {0}")]
    CreateId(#[source] VerbsError),

    #[error("cannot resolve host {host}: {source}")]
    HostResolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {host} starting at port {port} after {attempts} attempts")]
    BindExhausted {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("bound to {0} but no RDMA device backs it; make sure your NIC supports RDMA")]
    NoRdmaDevice(SocketAddr),

    #[error("failed to start listener: {0}")]
    Listen(#[source] VerbsError),

    #[error("listener id has no local address")]
    NoLocalAddress,

    #[error("failed to allocate protection domain: {0}")]
    ProtectionDomain(#[source] VerbsError),

    #[error("failed to spawn accept thread: {0}")]
    AcceptThread(#[source] std::io::Error),

    /// A single connect attempt failed and the caller asked not to retry.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: ChannelError,
    },

    #[error("timeout in establishing a connection to {addr} after {attempts} attempts")]
    ConnectTimeout { addr: SocketAddr, attempts: u32 },

    #[error("node stopped")]
    Stopped,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl NodeError {
    /// Maps an event-channel allocation failure, keeping a missing native
    /// library distinct from other failures.
    pub(crate) fn from_event_channel(err: VerbsError) -> Self {
        match err {
            VerbsError::LibraryMissing(msg) => NodeError::NativeBindingMissing(msg),
            other => NodeError::EventChannel(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_names_address() {
        let addr: SocketAddr = "10.0.0.1:1955".parse().unwrap();
        let err = NodeError::ConnectTimeout { addr, attempts: 3 };
        assert!(err.to_string().contains("10.0.0.1:1955"));
    }

    #[test]
    fn test_library_missing_is_distinct() {
        let err = NodeError::from_event_channel(VerbsError::LibraryMissing("gone".into()));
        assert!(matches!(err, NodeError::NativeBindingMissing(_)));
        let err = NodeError::from_event_channel(VerbsError::EventChannel("busy".into()));
        assert!(matches!(err, NodeError::EventChannel(_)));
    }

    #[test]
    fn test_channel_error_from_verbs() {
        let addr: SocketAddr = "10.0.0.1:1955".parse().unwrap();
        let err: ChannelError = VerbsError::Rejected(addr).into();
        assert!(matches!(err, ChannelError::Verbs(VerbsError::Rejected(_))));
    }
}
