//! Transport channel contract.
//!
//! The node never looks inside a channel: it only drives its lifecycle
//! (`connect`, `accept`, `finalize_connection`, `stop`) and reads its status
//! predicates. [`ChannelFactory`] is the seam through which the node creates
//! channels, so tests can substitute scripted ones.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rnode_verbs::Fabric;
use serde::{Deserialize, Serialize};

use crate::buffer::RdmaBufferManager;
use crate::config::NodeConfig;
use crate::error::ChannelError;
use crate::verbs_channel::VerbsChannel;

/// Role of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    /// Active side of an RDMA read connection.
    ReadRequestor,
    /// Passive side of an RDMA read connection.
    ReadResponder,
    RpcRequestor,
    RpcResponder,
}

impl ChannelType {
    /// Whether channels of this role are created for incoming requests.
    pub fn is_passive(&self) -> bool {
        match self {
            ChannelType::ReadResponder | ChannelType::RpcResponder => true,
            ChannelType::ReadRequestor | ChannelType::RpcRequestor => false,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::ReadRequestor => "read-requestor",
            ChannelType::ReadResponder => "read-responder",
            ChannelType::RpcRequestor => "rpc-requestor",
            ChannelType::RpcResponder => "rpc-responder",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Connecting,
    Connected,
    Error,
    Stopped,
}

/// Receives data-path completions from passive channels.
pub trait CompletionListener: Send + Sync {
    fn on_success(&self, data: &[u8]);

    fn on_failure(&self, err: &ChannelError);
}

/// One RDMA connection as seen by the node.
pub trait RdmaChannel: Send + Sync {
    fn kind(&self) -> ChannelType;

    /// Establish an active connection. Blocks until established or failed.
    fn connect(&self, addr: SocketAddr) -> Result<(), ChannelError>;

    /// Accept the incoming request this channel was created for.
    fn accept(&self) -> Result<(), ChannelError>;

    /// Mark a passive channel usable once the fabric reports it established.
    fn finalize_connection(&self);

    /// Tear the channel down. Idempotent.
    fn stop(&self) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;

    fn is_error(&self) -> bool;

    /// Block until the channel leaves the connecting state or the per-attempt
    /// timeout elapses.
    fn wait_for_active_connection(&self);

    fn state(&self) -> ChannelState;

    /// Remote address, once known.
    fn peer(&self) -> Option<SocketAddr>;
}

/// Shared handle to a channel, as stored in the registries.
pub type ChannelRef = Arc<dyn RdmaChannel>;

/// Everything a channel is created with.
pub struct ChannelSpec<F: Fabric> {
    pub kind: ChannelType,
    pub fabric: Arc<F>,
    pub config: Arc<NodeConfig>,
    pub buffers: Arc<RdmaBufferManager<F::Pd>>,
    pub listener: Option<Arc<dyn CompletionListener>>,
    /// Id of the incoming request, for passive channels.
    pub cm_id: Option<F::CmId>,
    pub completion_vector: u32,
    /// Source IP for active connections.
    pub local_ip: Option<IpAddr>,
}

/// Creates channels for a node.
pub trait ChannelFactory<F: Fabric>: Send + Sync {
    fn create(&self, spec: ChannelSpec<F>) -> ChannelRef;
}

/// Creates [`VerbsChannel`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerbsChannelFactory;

impl<F: Fabric> ChannelFactory<F> for VerbsChannelFactory {
    fn create(&self, spec: ChannelSpec<F>) -> ChannelRef {
        Arc::new(VerbsChannel::new(spec))
    }
}
