//! In-process loopback fabric.
//!
//! Implements the binding traits entirely in memory so that connection
//! managers can be exercised without RDMA hardware. Every endpoint created
//! from the same [`LoopbackFabric`] can reach every other one: a `connect`
//! towards an address with a listening id produces a `ConnectRequest` on the
//! listener's event channel, `accept` produces `Established` on both sides,
//! and `disconnect` produces `Disconnected` on both sides.
//!
//! The fabric also exposes fault knobs (missing library, non-RDMA device,
//! blocked ports, failing PD allocation) and counters that tests use to
//! check for leaked resources.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use crate::cm::{
    CmEvent, CmEventType, CmId, ConnParam, EventChannel, Fabric, MemoryRegion, PortSpace,
    ProtectionDomain, VerbsContext,
};
use crate::error::{Result, VerbsError};

/// First port handed out when binding to port 0.
pub const EPHEMERAL_PORT_START: u16 = 40000;

const ECONNREFUSED: i32 = -111;

/// Handle to an in-process fabric. Clones share the same fabric.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    name: String,
    library_present: AtomicBool,
    rdma_capable: AtomicBool,
    fail_pd_alloc: AtomicBool,
    fail_event_channel: AtomicBool,
    blocked_ports: DashSet<u16>,
    bind_lock: Mutex<()>,
    bound: DashMap<SocketAddr, Weak<IdInner>>,
    listeners: DashMap<SocketAddr, Weak<IdInner>>,
    next_port: AtomicU16,
    next_handle: AtomicU32,
    connect_attempts: DashMap<SocketAddr, usize>,
    live_ids: AtomicUsize,
    live_channels: AtomicUsize,
    live_pds: AtomicUsize,
    live_regions: AtomicUsize,
    acked_events: AtomicUsize,
}

impl FabricInner {
    fn next_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn port_taken(&self, addr: SocketAddr) -> bool {
        self.bound.iter().any(|entry| {
            let other = entry.key();
            other.port() == addr.port()
                && (other.ip() == addr.ip()
                    || other.ip().is_unspecified()
                    || addr.ip().is_unspecified())
                && entry.value().upgrade().map_or(false, |id| !id.state.lock().destroyed)
        })
    }

    fn bind(&self, id: &Arc<IdInner>, requested: SocketAddr) -> Result<SocketAddr> {
        let _guard = self.bind_lock.lock();

        if requested.port() != 0 && self.blocked_ports.contains(&requested.port()) {
            return Err(VerbsError::PortBlocked(requested.port()));
        }

        let addr = if requested.port() == 0 {
            self.ephemeral(requested.ip())?
        } else {
            if self.port_taken(requested) {
                return Err(VerbsError::AddrInUse(requested));
            }
            requested
        };

        self.bound.insert(addr, Arc::downgrade(id));
        Ok(addr)
    }

    fn ephemeral(&self, ip: IpAddr) -> Result<SocketAddr> {
        for _ in 0..(u16::MAX - EPHEMERAL_PORT_START) {
            let mut port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port < EPHEMERAL_PORT_START {
                self.next_port.store(EPHEMERAL_PORT_START + 1, Ordering::Relaxed);
                port = EPHEMERAL_PORT_START;
            }
            let candidate = SocketAddr::new(ip, port);
            if !self.blocked_ports.contains(&port) && !self.port_taken(candidate) {
                return Ok(candidate);
            }
        }
        Err(VerbsError::AddrInUse(SocketAddr::new(ip, 0)))
    }

    fn release(&self, id: &Arc<IdInner>, local: SocketAddr) {
        let same = |_: &SocketAddr, weak: &Weak<IdInner>| {
            weak.upgrade().map_or(true, |other| Arc::ptr_eq(&other, id))
        };
        self.bound.remove_if(&local, same);
        self.listeners.remove_if(&local, same);
    }

    fn find_listener(&self, dst: SocketAddr) -> Option<Arc<IdInner>> {
        let wildcard = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), dst.port());
        [dst, wildcard].iter().find_map(|addr| {
            let listener = self.listeners.get(addr)?.upgrade()?;
            let state = listener.state.lock();
            (state.listening && !state.destroyed).then(|| Arc::clone(&listener))
        })
    }
}

impl LoopbackFabric {
    /// Create a new, empty fabric.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                name: name.into(),
                library_present: AtomicBool::new(true),
                rdma_capable: AtomicBool::new(true),
                fail_pd_alloc: AtomicBool::new(false),
                fail_event_channel: AtomicBool::new(false),
                blocked_ports: DashSet::new(),
                bind_lock: Mutex::new(()),
                bound: DashMap::new(),
                listeners: DashMap::new(),
                next_port: AtomicU16::new(EPHEMERAL_PORT_START),
                next_handle: AtomicU32::new(1),
                connect_attempts: DashMap::new(),
                live_ids: AtomicUsize::new(0),
                live_channels: AtomicUsize::new(0),
                live_pds: AtomicUsize::new(0),
                live_regions: AtomicUsize::new(0),
                acked_events: AtomicUsize::new(0),
            }),
        }
    }

    /// Pretend the native library is (or is not) installed.
    pub fn set_library_present(&self, present: bool) {
        self.inner.library_present.store(present, Ordering::SeqCst);
    }

    /// When `false`, bound ids report no device context.
    pub fn set_rdma_capable(&self, capable: bool) {
        self.inner.rdma_capable.store(capable, Ordering::SeqCst);
    }

    /// Make binds to `port` fail.
    pub fn block_port(&self, port: u16) {
        self.inner.blocked_ports.insert(port);
    }

    pub fn unblock_port(&self, port: u16) {
        self.inner.blocked_ports.remove(&port);
    }

    pub fn set_fail_pd_alloc(&self, fail: bool) {
        self.inner.fail_pd_alloc.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_event_channel(&self, fail: bool) {
        self.inner.fail_event_channel.store(fail, Ordering::SeqCst);
    }

    /// Deliver `kind` on the event channel of the id listening on
    /// `listener`, carrying a fresh passive id whose destination is `peer`.
    ///
    /// The injected id has no peer side, so `accept` on it fails with
    /// [`VerbsError::NoPeer`].
    pub fn post_event(
        &self,
        listener: SocketAddr,
        kind: CmEventType,
        peer: SocketAddr,
    ) -> Result<LoopbackCmId> {
        let listener_id = self
            .inner
            .find_listener(listener)
            .ok_or(VerbsError::Unreachable(listener))?;
        let id = IdInner::passive(&self.inner, &listener_id.channel, listener, peer, None);
        listener_id.channel.post(kind, id.clone(), 0);
        Ok(id)
    }

    /// Number of `connect` calls made towards `dst`.
    pub fn connect_attempts(&self, dst: SocketAddr) -> usize {
        self.inner
            .connect_attempts
            .get(&dst)
            .map(|n| *n.value())
            .unwrap_or(0)
    }

    /// Whether some id is listening on `addr`.
    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.inner.find_listener(addr).is_some()
    }

    pub fn live_ids(&self) -> usize {
        self.inner.live_ids.load(Ordering::SeqCst)
    }

    pub fn live_event_channels(&self) -> usize {
        self.inner.live_channels.load(Ordering::SeqCst)
    }

    pub fn live_pds(&self) -> usize {
        self.inner.live_pds.load(Ordering::SeqCst)
    }

    pub fn live_regions(&self) -> usize {
        self.inner.live_regions.load(Ordering::SeqCst)
    }

    pub fn acked_events(&self) -> usize {
        self.inner.acked_events.load(Ordering::SeqCst)
    }

    fn check_library(&self) -> Result<()> {
        if self.inner.library_present.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VerbsError::LibraryMissing(
                "librdmacm.so.1: cannot open shared object file".into(),
            ))
        }
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new("loopback")
    }
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackFabric")
            .field("name", &self.inner.name)
            .field("live_ids", &self.live_ids())
            .field("live_event_channels", &self.live_event_channels())
            .finish()
    }
}

impl Fabric for LoopbackFabric {
    type Pd = LoopbackPd;
    type Context = LoopbackContext;
    type CmId = LoopbackCmId;
    type Event = LoopbackEvent;
    type EventChannel = LoopbackEventChannel;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn create_event_channel(&self) -> Result<Arc<LoopbackEventChannel>> {
        self.check_library()?;
        if self.inner.fail_event_channel.load(Ordering::SeqCst) {
            return Err(VerbsError::EventChannel("injected failure".into()));
        }
        let (tx, rx) = channel::unbounded();
        self.inner.live_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackEventChannel {
            fabric: Arc::clone(&self.inner),
            tx,
            rx,
            destroyed: AtomicBool::new(false),
        }))
    }

    fn create_id(
        &self,
        channel: &Arc<LoopbackEventChannel>,
        _port_space: PortSpace,
    ) -> Result<LoopbackCmId> {
        self.check_library()?;
        if channel.destroyed.load(Ordering::SeqCst) {
            return Err(VerbsError::ChannelClosed);
        }
        Ok(IdInner::create(&self.inner, channel, IdState::default()))
    }
}

// ---------------------------------------------------------------------------
// Event channel
// ---------------------------------------------------------------------------

/// Event channel of the loopback fabric.
pub struct LoopbackEventChannel {
    fabric: Arc<FabricInner>,
    tx: Sender<LoopbackEvent>,
    rx: Receiver<LoopbackEvent>,
    destroyed: AtomicBool,
}

impl LoopbackEventChannel {
    fn post(&self, kind: CmEventType, id: LoopbackCmId, status: i32) {
        if self.destroyed.load(Ordering::SeqCst) {
            tracing::trace!(event = %kind, "dropping event for destroyed channel");
            return;
        }
        let event = LoopbackEvent {
            kind,
            id,
            status,
            fabric: Arc::clone(&self.fabric),
        };
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.tx.send(event);
    }

    /// Number of events waiting to be read.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl EventChannel for LoopbackEventChannel {
    type Event = LoopbackEvent;

    fn get_cm_event(&self, timeout: Duration) -> Result<Option<LoopbackEvent>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(VerbsError::ChannelClosed);
        }
        if timeout.is_zero() {
            return match self.rx.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(VerbsError::ChannelClosed),
            };
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(VerbsError::ChannelClosed),
        }
    }

    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Queued events hold ids that point back at this channel.
        self.rx.try_iter().for_each(drop);
        self.fabric.live_channels.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An event delivered by the loopback fabric.
pub struct LoopbackEvent {
    kind: CmEventType,
    id: LoopbackCmId,
    status: i32,
    fabric: Arc<FabricInner>,
}

impl CmEvent for LoopbackEvent {
    type CmId = LoopbackCmId;

    fn event_type(&self) -> CmEventType {
        self.kind
    }

    fn conn_id(&self) -> LoopbackCmId {
        self.id.clone()
    }

    fn status(&self) -> i32 {
        self.status
    }

    fn ack(self) {
        self.fabric.acked_events.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// CM id
// ---------------------------------------------------------------------------

/// A connection identifier on the loopback fabric.
#[derive(Clone)]
pub struct LoopbackCmId(Arc<IdInner>);

struct IdInner {
    handle: u32,
    fabric: Arc<FabricInner>,
    channel: Arc<LoopbackEventChannel>,
    state: Mutex<IdState>,
}

#[derive(Default)]
struct IdState {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    peer: Option<Weak<IdInner>>,
    bound: bool,
    listening: bool,
    connected: bool,
    destroyed: bool,
}

impl IdInner {
    fn create(
        fabric: &Arc<FabricInner>,
        channel: &Arc<LoopbackEventChannel>,
        state: IdState,
    ) -> LoopbackCmId {
        fabric.live_ids.fetch_add(1, Ordering::SeqCst);
        LoopbackCmId(Arc::new(IdInner {
            handle: fabric.next_handle(),
            fabric: Arc::clone(fabric),
            channel: Arc::clone(channel),
            state: Mutex::new(state),
        }))
    }

    fn passive(
        fabric: &Arc<FabricInner>,
        channel: &Arc<LoopbackEventChannel>,
        local: SocketAddr,
        remote: SocketAddr,
        peer: Option<Weak<IdInner>>,
    ) -> LoopbackCmId {
        Self::create(
            fabric,
            channel,
            IdState {
                local: Some(local),
                remote: Some(remote),
                peer,
                ..IdState::default()
            },
        )
    }
}

impl LoopbackCmId {
    /// Numeric handle, for diagnostics.
    pub fn handle(&self) -> u32 {
        self.0.handle
    }

    pub fn is_connected(&self) -> bool {
        self.0.state.lock().connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.state.lock().destroyed
    }

    fn post_self(&self, kind: CmEventType, status: i32) {
        self.0.channel.post(kind, self.clone(), status);
    }

    fn live_state(&self) -> Result<parking_lot::MutexGuard<'_, IdState>> {
        let state = self.0.state.lock();
        if state.destroyed {
            return Err(VerbsError::InvalidState("id destroyed".into()));
        }
        Ok(state)
    }
}

impl fmt::Debug for LoopbackCmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("LoopbackCmId")
            .field("handle", &self.0.handle)
            .field("local", &state.local)
            .field("remote", &state.remote)
            .field("connected", &state.connected)
            .finish()
    }
}

impl CmId for LoopbackCmId {
    type Context = LoopbackContext;

    fn bind_addr(&self, addr: SocketAddr) -> Result<()> {
        {
            let state = self.live_state()?;
            if state.bound {
                return Err(VerbsError::InvalidState("id already bound".into()));
            }
        }
        let actual = self.0.fabric.bind(&self.0, addr)?;
        let mut state = self.0.state.lock();
        state.local = Some(actual);
        state.bound = true;
        Ok(())
    }

    fn listen(&self, backlog: i32) -> Result<()> {
        let mut state = self.live_state()?;
        if !state.bound {
            return Err(VerbsError::NotBound);
        }
        if backlog <= 0 {
            return Err(VerbsError::Listen(format!("invalid backlog {}", backlog)));
        }
        let local = state.local.ok_or(VerbsError::NotBound)?;
        state.listening = true;
        drop(state);
        self.0.fabric.listeners.insert(local, Arc::downgrade(&self.0));
        Ok(())
    }

    fn resolve_addr(
        &self,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        _timeout: Duration,
    ) -> Result<()> {
        let needs_bind = !self.live_state()?.bound;
        if needs_bind {
            let src = src.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
            self.bind_addr(src)?;
        }
        self.0.state.lock().remote = Some(dst);
        self.post_self(CmEventType::AddrResolved, 0);
        Ok(())
    }

    fn resolve_route(&self, _timeout: Duration) -> Result<()> {
        let state = self.live_state()?;
        if state.remote.is_none() {
            return Err(VerbsError::InvalidState("address not resolved".into()));
        }
        drop(state);
        self.post_self(CmEventType::RouteResolved, 0);
        Ok(())
    }

    fn connect(&self, _param: &ConnParam) -> Result<()> {
        let (local, dst) = {
            let state = self.live_state()?;
            match (state.local, state.remote) {
                (Some(local), Some(dst)) => (local, dst),
                _ => return Err(VerbsError::InvalidState("route not resolved".into())),
            }
        };

        *self.0.fabric.connect_attempts.entry(dst).or_insert(0) += 1;

        let Some(listener) = self.0.fabric.find_listener(dst) else {
            tracing::debug!(%dst, "no listener, rejecting");
            self.post_self(CmEventType::Rejected, ECONNREFUSED);
            return Ok(());
        };

        let passive = IdInner::passive(
            &self.0.fabric,
            &listener.channel,
            dst,
            local,
            Some(Arc::downgrade(&self.0)),
        );
        self.0.state.lock().peer = Some(Arc::downgrade(&passive.0));
        listener.channel.post(CmEventType::ConnectRequest, passive, 0);
        Ok(())
    }

    fn accept(&self, _param: &ConnParam) -> Result<()> {
        let peer = {
            let mut state = self.live_state()?;
            let peer = state
                .peer
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or(VerbsError::NoPeer)?;
            state.connected = true;
            peer
        };
        let peer = LoopbackCmId(peer);
        {
            let mut peer_state = peer.live_state()?;
            peer_state.connected = true;
        }
        self.post_self(CmEventType::Established, 0);
        peer.post_self(CmEventType::Established, 0);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let peer = {
            let mut state = self.0.state.lock();
            if !state.connected {
                return Ok(());
            }
            state.connected = false;
            state.peer.as_ref().and_then(Weak::upgrade)
        };
        self.post_self(CmEventType::Disconnected, 0);

        if let Some(peer) = peer.map(LoopbackCmId) {
            let notify = {
                let mut peer_state = peer.0.state.lock();
                std::mem::replace(&mut peer_state.connected, false)
            };
            if notify {
                peer.post_self(CmEventType::Disconnected, 0);
            }
        }
        Ok(())
    }

    fn source(&self) -> Option<SocketAddr> {
        self.0.state.lock().local
    }

    fn destination(&self) -> Option<SocketAddr> {
        self.0.state.lock().remote
    }

    fn verbs(&self) -> Option<LoopbackContext> {
        let state = self.0.state.lock();
        let usable = (state.bound || state.remote.is_some()) && !state.destroyed;
        (usable && self.0.fabric.rdma_capable.load(Ordering::SeqCst)).then(|| LoopbackContext {
            fabric: Arc::clone(&self.0.fabric),
        })
    }

    fn destroy(&self) -> Result<()> {
        let local = {
            let mut state = self.0.state.lock();
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
            state.listening = false;
            state.connected = false;
            state.bound.then_some(state.local).flatten()
        };
        if let Some(local) = local {
            self.0.fabric.release(&self.0, local);
        }
        self.0.fabric.live_ids.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device context and protection domain
// ---------------------------------------------------------------------------

/// Device context of a bound loopback id.
pub struct LoopbackContext {
    fabric: Arc<FabricInner>,
}

impl VerbsContext for LoopbackContext {
    type Pd = LoopbackPd;

    fn device_name(&self) -> String {
        format!("{}_0", self.fabric.name)
    }

    fn alloc_pd(&self) -> Result<LoopbackPd> {
        if self.fabric.fail_pd_alloc.load(Ordering::SeqCst) {
            return Err(VerbsError::AllocPd("injected failure".into()));
        }
        self.fabric.live_pds.fetch_add(1, Ordering::SeqCst);
        Ok(LoopbackPd {
            handle: self.fabric.next_handle(),
            fabric: Arc::clone(&self.fabric),
            regions: DashSet::new(),
            released: AtomicBool::new(false),
        })
    }
}

/// Protection domain of the loopback fabric.
pub struct LoopbackPd {
    handle: u32,
    fabric: Arc<FabricInner>,
    regions: DashSet<u32>,
    released: AtomicBool,
}

impl LoopbackPd {
    /// Number of regions currently registered in this domain.
    pub fn registered(&self) -> usize {
        self.regions.len()
    }
}

impl ProtectionDomain for LoopbackPd {
    fn handle(&self) -> u32 {
        self.handle
    }

    fn register(&self, addr: u64, len: usize) -> Result<MemoryRegion> {
        if self.released.load(Ordering::SeqCst) {
            return Err(VerbsError::RegisterMemory {
                len,
                reason: "protection domain released".into(),
            });
        }
        let key = self.fabric.next_handle();
        self.regions.insert(key);
        self.fabric.live_regions.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryRegion {
            addr,
            length: len as u64,
            lkey: key,
            rkey: key,
        })
    }

    fn deregister(&self, region: &MemoryRegion) -> Result<()> {
        if self.regions.remove(&region.lkey).is_some() {
            self.fabric.live_regions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn dealloc(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.regions.is_empty() {
            tracing::warn!(
                pd = self.handle,
                regions = self.regions.len(),
                "deallocating protection domain with registered regions"
            );
        }
        self.fabric.live_pds.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
