//! RDMA connection-manager node.
//!
//! This crate manages the control plane of a point-to-point RDMA transport:
//! it owns a local endpoint, accepts and tracks inbound connections,
//! establishes and tracks outbound connections, and tears everything down in
//! a coordinated way. It is written against the binding traits of
//! `rnode-verbs`, so it runs unchanged over any [`Fabric`](rnode_verbs::Fabric)
//! implementation, including the in-process loopback fabric.
//!
//! # Architecture
//!
//! - `RdmaNode`: One endpoint; accept loop, connection acquisition, shutdown.
//! - `ActiveRegistry` / `PassiveRegistry`: Outbound and inbound channels keyed by peer address.
//! - `RdmaChannel`: The lifecycle contract the node drives for each connection.
//! - `VerbsChannel`: The default channel, built on the fabric's CM ids.
//! - `RdmaBufferManager`: Buffers registered against the node's protection domain.
//! - `NodeConfig`: Ports, timeouts, retry bounds and queue sizing.

pub mod affinity;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod node;
pub mod registry;
pub mod shutdown;
pub mod verbs_channel;

#[cfg(test)]
pub(crate) mod testing;

pub use affinity::{AffinityContext, CompletionVectorSelector, FixedVector};
pub use buffer::{RdmaBufferManager, RegisteredBuffer};
pub use channel::{
    ChannelFactory, ChannelRef, ChannelSpec, ChannelState, ChannelType, CompletionListener,
    RdmaChannel, VerbsChannelFactory,
};
pub use config::NodeConfig;
pub use error::{BufferError, ChannelError, ConfigError, NodeError, Result};
pub use node::{AcceptLoopState, RdmaNode, RdmaNodeBuilder};
pub use registry::{ActiveRegistry, PassiveRegistry};
pub use shutdown::StopReport;
pub use verbs_channel::VerbsChannel;
