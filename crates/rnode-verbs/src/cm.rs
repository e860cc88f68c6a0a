//! Connection-manager binding traits.
//!
//! These traits describe the subset of `librdmacm` / `libibverbs` that a
//! connection manager needs: an event channel that yields CM events, CM ids
//! that bind, listen, connect and accept, and the protection domain that
//! memory registrations hang off. A [`Fabric`] ties one implementation of
//! each together.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Port space a CM id is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortSpace {
    Tcp,
    Udp,
    Ib,
    Ipoib,
}

/// Connection-manager event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventType {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
    Unknown(u32),
}

impl CmEventType {
    /// Whether this event reports that an in-flight connection attempt failed.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CmEventType::AddrError
                | CmEventType::RouteError
                | CmEventType::ConnectError
                | CmEventType::Unreachable
                | CmEventType::Rejected
                | CmEventType::DeviceRemoval
        )
    }
}

impl fmt::Display for CmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmEventType::AddrResolved => write!(f, "ADDR_RESOLVED"),
            CmEventType::AddrError => write!(f, "ADDR_ERROR"),
            CmEventType::RouteResolved => write!(f, "ROUTE_RESOLVED"),
            CmEventType::RouteError => write!(f, "ROUTE_ERROR"),
            CmEventType::ConnectRequest => write!(f, "CONNECT_REQUEST"),
            CmEventType::ConnectResponse => write!(f, "CONNECT_RESPONSE"),
            CmEventType::ConnectError => write!(f, "CONNECT_ERROR"),
            CmEventType::Unreachable => write!(f, "UNREACHABLE"),
            CmEventType::Rejected => write!(f, "REJECTED"),
            CmEventType::Established => write!(f, "ESTABLISHED"),
            CmEventType::Disconnected => write!(f, "DISCONNECTED"),
            CmEventType::DeviceRemoval => write!(f, "DEVICE_REMOVAL"),
            CmEventType::MulticastJoin => write!(f, "MULTICAST_JOIN"),
            CmEventType::MulticastError => write!(f, "MULTICAST_ERROR"),
            CmEventType::AddrChange => write!(f, "ADDR_CHANGE"),
            CmEventType::TimewaitExit => write!(f, "TIMEWAIT_EXIT"),
            CmEventType::Unknown(v) => write!(f, "UNKNOWN({})", v),
        }
    }
}

/// Parameters passed to `connect` / `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParam {
    /// Responder resources (max incoming RDMA read/atomic).
    pub responder_resources: u8,
    /// Initiator depth (max outstanding RDMA read/atomic).
    pub initiator_depth: u8,
    /// Transport retry count.
    pub retry_count: u8,
    /// RNR retry count (7 = infinite).
    pub rnr_retry_count: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }
}

/// A registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// Registered virtual address.
    pub addr: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Local key.
    pub lkey: u32,
    /// Remote key.
    pub rkey: u32,
}

/// A protection domain.
pub trait ProtectionDomain: Send + Sync + 'static {
    /// Numeric handle of the domain, for diagnostics.
    fn handle(&self) -> u32;

    /// Register `len` bytes starting at `addr`.
    fn register(&self, addr: u64, len: usize) -> Result<MemoryRegion>;

    /// Deregister a region previously returned by [`register`](Self::register).
    fn deregister(&self, region: &MemoryRegion) -> Result<()>;

    /// Release the domain. Calling it twice is a no-op.
    fn dealloc(&self) -> Result<()>;
}

/// The device context a bound CM id resolves to.
pub trait VerbsContext: Send + Sync + 'static {
    type Pd: ProtectionDomain;

    fn device_name(&self) -> String;

    fn alloc_pd(&self) -> Result<Self::Pd>;
}

/// A connection identifier. Handles are cheap to clone and refer to the same
/// underlying id.
pub trait CmId: Clone + Send + Sync + 'static {
    type Context: VerbsContext;

    fn bind_addr(&self, addr: SocketAddr) -> Result<()>;

    fn listen(&self, backlog: i32) -> Result<()>;

    /// Resolve `dst`, optionally from a specific source address.
    ///
    /// Completion is reported as an `AddrResolved` (or `AddrError`) event on
    /// the id's event channel.
    fn resolve_addr(&self, src: Option<SocketAddr>, dst: SocketAddr, timeout: Duration)
        -> Result<()>;

    /// Resolve the route after address resolution. Reports `RouteResolved`.
    fn resolve_route(&self, timeout: Duration) -> Result<()>;

    /// Start an active connection. Reports `Established` or a failure event.
    fn connect(&self, param: &ConnParam) -> Result<()>;

    /// Accept a connection request this id was created for.
    fn accept(&self, param: &ConnParam) -> Result<()>;

    /// Tear down an established connection. Idempotent.
    fn disconnect(&self) -> Result<()>;

    /// Local address, once bound or resolved.
    fn source(&self) -> Option<SocketAddr>;

    /// Remote address, once resolved or for ids created by a connect request.
    fn destination(&self) -> Option<SocketAddr>;

    /// Device context. `None` means the id is not backed by an RDMA device.
    fn verbs(&self) -> Option<Self::Context>;

    /// Destroy the id. Calling it twice is a no-op.
    fn destroy(&self) -> Result<()>;
}

/// A single connection-manager event.
pub trait CmEvent: Send + 'static {
    type CmId: CmId;

    fn event_type(&self) -> CmEventType;

    /// The id the event refers to. For `ConnectRequest` this is the new id
    /// created for the incoming connection.
    fn conn_id(&self) -> Self::CmId;

    fn status(&self) -> i32;

    /// Acknowledge the event. Every event must be acknowledged exactly once.
    fn ack(self);
}

/// A channel CM events are delivered on.
pub trait EventChannel: Send + Sync + 'static {
    type Event: CmEvent;

    /// Wait up to `timeout` for the next event. `Ok(None)` means the timeout
    /// elapsed with nothing to report.
    fn get_cm_event(&self, timeout: Duration) -> Result<Option<Self::Event>>;

    /// Destroy the channel. Calling it twice is a no-op.
    fn destroy(&self) -> Result<()>;
}

/// One implementation of the binding.
pub trait Fabric: Send + Sync + 'static {
    type Pd: ProtectionDomain;
    type Context: VerbsContext<Pd = Self::Pd>;
    type CmId: CmId<Context = Self::Context>;
    type Event: CmEvent<CmId = Self::CmId>;
    type EventChannel: EventChannel<Event = Self::Event>;

    /// Short name used in logs.
    fn name(&self) -> &str;

    fn create_event_channel(&self) -> Result<Arc<Self::EventChannel>>;

    fn create_id(&self, channel: &Arc<Self::EventChannel>, port_space: PortSpace)
        -> Result<Self::CmId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_events() {
        assert!(CmEventType::Rejected.is_failure());
        assert!(CmEventType::Unreachable.is_failure());
        assert!(CmEventType::AddrError.is_failure());
        assert!(!CmEventType::Established.is_failure());
        assert!(!CmEventType::Disconnected.is_failure());
        assert!(!CmEventType::ConnectRequest.is_failure());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(CmEventType::ConnectRequest.to_string(), "CONNECT_REQUEST");
        assert_eq!(CmEventType::Unknown(42).to_string(), "UNKNOWN(42)");
    }

    #[test]
    fn test_conn_param_serde() {
        let param = ConnParam {
            responder_resources: 4,
            ..ConnParam::default()
        };
        let json = serde_json::to_string(&param).unwrap();
        let back: ConnParam = serde_json::from_str(&json).unwrap();
        assert_eq!(back, param);
        assert_eq!(back.rnr_retry_count, 7);
    }
}
