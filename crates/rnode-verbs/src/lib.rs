//! RDMA connection-manager binding for rnode.
//!
//! This crate defines the connection-manager surface a node is written
//! against: event channels, CM ids, device contexts and protection domains.
//! It is modeled after `librdmacm` (`rdma_create_event_channel`,
//! `rdma_create_id`, `rdma_get_cm_event`, ...) and `libibverbs`
//! (`ibv_alloc_pd`, `ibv_reg_mr`).
//!
//! No native binding ships with this crate. [`loopback::LoopbackFabric`]
//! implements the traits in memory so that everything above the binding can
//! run and be tested without RDMA hardware.
//!
//! # Architecture
//!
//! - `Fabric`: One implementation of the binding; creates event channels and ids.
//! - `EventChannel` / `CmEvent`: Asynchronous connection-manager events.
//! - `CmId`: A connection identifier (listening, active or passive).
//! - `VerbsContext` / `ProtectionDomain`: Device context and memory registration.
//! - `LoopbackFabric`: In-process fabric with fault injection.

pub mod cm;
pub mod error;
pub mod loopback;

pub use cm::{
    CmEvent, CmEventType, CmId, ConnParam, EventChannel, Fabric, MemoryRegion, PortSpace,
    ProtectionDomain, VerbsContext,
};
pub use error::{Result, VerbsError};
pub use loopback::{LoopbackCmId, LoopbackEventChannel, LoopbackFabric, LoopbackPd};
