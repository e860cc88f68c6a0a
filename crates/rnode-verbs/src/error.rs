use std::net::SocketAddr;

use thiserror::Error;

/// Errors reported by an RDMA connection-manager binding.
#[derive(Debug, Clone, Error)]
pub enum VerbsError {
    /// The native RDMA library could not be loaded.
    #[error("native RDMA library not available: {0}")]
    LibraryMissing(String),

    /// Allocating an event channel failed.
    #[error("unable to allocate RDMA event channel: {0}")]
    EventChannel(String),

    /// Allocating a connection identifier failed.
    #[error("unable to allocate RDMA CM id: {0}")]
    CreateId(String),

    /// The requested local address is already bound.
    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),

    /// The requested port is not available to this process.
    #[error("port {0} is not available")]
    PortBlocked(u16),

    /// The operation needs a bound identifier.
    #[error("CM id is not bound")]
    NotBound,

    /// `listen` failed.
    #[error("listen failed: {0}")]
    Listen(String),

    /// The identifier has no RDMA-capable device behind it.
    #[error("no RDMA device behind {0}")]
    NoDevice(SocketAddr),

    /// Protection domain allocation failed.
    #[error("failed to allocate protection domain: {0}")]
    AllocPd(String),

    /// Memory registration failed.
    #[error("failed to register {len} bytes: {reason}")]
    RegisterMemory { len: usize, reason: String },

    /// Address or route resolution failed.
    #[error("failed to resolve {0}")]
    Resolve(SocketAddr),

    /// The destination could not be reached.
    #[error("destination {0} unreachable")]
    Unreachable(SocketAddr),

    /// The remote side rejected the connection.
    #[error("connection to {0} rejected")]
    Rejected(SocketAddr),

    /// The identifier is not in a state that allows the operation.
    #[error("invalid CM id state: {0}")]
    InvalidState(String),

    /// The peer identifier is gone.
    #[error("peer identifier no longer exists")]
    NoPeer,

    /// The event channel was destroyed.
    #[error("event channel closed")]
    ChannelClosed,

    /// A blocking call ran out of time.
    #[error("timed out")]
    Timeout,
}

/// Convenience result type for binding operations.
pub type Result<T> = std::result::Result<T, VerbsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_address() {
        let addr: SocketAddr = "10.0.0.1:1955".parse().unwrap();
        assert_eq!(
            VerbsError::Rejected(addr).to_string(),
            "connection to 10.0.0.1:1955 rejected"
        );
        assert!(VerbsError::AddrInUse(addr).to_string().contains("10.0.0.1:1955"));
    }

    #[test]
    fn test_display_register_memory() {
        let err = VerbsError::RegisterMemory {
            len: 4096,
            reason: "pinned limit".into(),
        };
        assert_eq!(err.to_string(), "failed to register 4096 bytes: pinned limit");
    }
}
