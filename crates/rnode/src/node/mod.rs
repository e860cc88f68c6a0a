//! The RDMA node.
//!
//! An [`RdmaNode`] owns one local endpoint: an event channel, a root CM id
//! bound and listening on the node's address, the protection domain shared by
//! every channel it creates, and the registered-buffer manager. Unless it is
//! built in client mode, a dedicated accept thread (`rnode-accept`) drives
//! incoming connections into the passive registry.
//!
//! Outgoing connections are obtained with [`RdmaNode::get_rdma_channel`],
//! which returns the one channel registered for an address, creating and
//! connecting it if needed.

mod accept;
mod acquire;


use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use rnode_verbs::{CmId, Fabric, PortSpace, VerbsContext};

use crate::affinity::{AffinityContext, CompletionVectorSelector, FixedVector};
use crate::buffer::RdmaBufferManager;
use crate::channel::{
    ChannelFactory, ChannelRef, ChannelSpec, ChannelType, CompletionListener, VerbsChannelFactory,
};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::registry::{ActiveRegistry, PassiveRegistry};
use crate::shutdown::{self, NodeResources, StopReport};

/// Health of the accept thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptLoopState {
    /// Client-mode node, or the thread has not started yet.
    NotStarted,
    Running,
    /// Left the loop after the node stopped.
    Exited,
    /// Left the loop because the event channel failed.
    Failed,
}

/// State shared between the node handle and its accept thread.
pub(crate) struct NodeShared<F: Fabric> {
    pub(crate) fabric: Arc<F>,
    pub(crate) config: Arc<NodeConfig>,
    pub(crate) factory: Arc<dyn ChannelFactory<F>>,
    pub(crate) selector: Arc<dyn CompletionVectorSelector>,
    pub(crate) listener: Option<Arc<dyn CompletionListener>>,
    pub(crate) active: ActiveRegistry,
    pub(crate) passive: PassiveRegistry,
    pub(crate) running: AtomicBool,
    pub(crate) stopped: AtomicBool,
    pub(crate) accept_state: Mutex<AcceptLoopState>,
    pub(crate) resources: Mutex<NodeResources<F>>,
    pub(crate) local_addr: Mutex<Option<SocketAddr>>,
}

impl<F: Fabric> NodeShared<F> {
    /// Acquire the event channel, root id, protection domain and buffer
    /// manager. Each resource is recorded as soon as it exists so a failure
    /// part way leaves only released-on-shutdown state behind.
    fn open(&self, host: &str) -> Result<(SocketAddr, Arc<RdmaBufferManager<F::Pd>>)> {
        let events = self
            .fabric
            .create_event_channel()
            .map_err(NodeError::from_event_channel)?;
        self.resources.lock().event_channel = Some(Arc::clone(&events));

        let id = self
            .fabric
            .create_id(&events, PortSpace::Tcp)
            .map_err(NodeError::CreateId)?;
        self.resources.lock().listen_id = Some(id.clone());

        let ip = resolve_host(host)?;
        let bound = self.bind(&id, host, ip)?;
        let context = id.verbs().ok_or(NodeError::NoRdmaDevice(bound))?;

        id.listen(self.config.listen_backlog)
            .map_err(NodeError::Listen)?;
        let local = id.source().ok_or(NodeError::NoLocalAddress)?;
        *self.local_addr.lock() = Some(local);

        let pd = Arc::new(context.alloc_pd().map_err(NodeError::ProtectionDomain)?);
        self.resources.lock().pd = Some(Arc::clone(&pd));

        let buffers = Arc::new(RdmaBufferManager::new(pd, &self.config));
        self.resources.lock().buffers = Some(Arc::clone(&buffers));

        tracing::info!(
            %local,
            device = %context.device_name(),
            backlog = self.config.listen_backlog,
            "rdma node listening"
        );
        Ok((local, buffers))
    }

    fn bind(&self, id: &F::CmId, host: &str, ip: IpAddr) -> Result<SocketAddr> {
        let mut port = self.config.port;
        for attempt in 0..self.config.port_max_retries {
            let addr = SocketAddr::new(ip, port);
            match id.bind_addr(addr) {
                Ok(()) => return Ok(id.source().unwrap_or(addr)),
                Err(e) => {
                    tracing::info!(port, attempt, "failed to bind: {}", e);
                    if port != 0 {
                        match port.checked_add(1) {
                            Some(next) => port = next,
                            None => break,
                        }
                    }
                }
            }
        }
        Err(NodeError::BindExhausted {
            host: host.to_string(),
            port: self.config.port,
            attempts: self.config.port_max_retries,
        })
    }

    /// Build a new channel through the node's factory.
    pub(crate) fn new_channel(
        &self,
        kind: ChannelType,
        cm_id: Option<F::CmId>,
        peer: Option<SocketAddr>,
    ) -> Result<ChannelRef> {
        let buffers = self
            .resources
            .lock()
            .buffers
            .clone()
            .ok_or(NodeError::Stopped)?;
        let local = *self.local_addr.lock();
        let completion_vector = self.selector.next_vector(&AffinityContext { kind, local, peer });
        let spec = ChannelSpec {
            kind,
            fabric: Arc::clone(&self.fabric),
            config: Arc::clone(&self.config),
            buffers,
            listener: if kind.is_passive() {
                self.listener.clone()
            } else {
                None
            },
            cm_id,
            completion_vector,
            local_ip: local.map(|a| a.ip()).filter(|ip| !ip.is_unspecified()),
        };
        Ok(self.factory.create(spec))
    }

    fn set_accept_state(&self, state: AcceptLoopState) {
        *self.accept_state.lock() = state;
    }
}

fn resolve_host(host: &str) -> Result<IpAddr> {
    let resolution = |source: std::io::Error| NodeError::HostResolution {
        host: host.to_string(),
        source,
    };
    let mut addrs = (host, 0).to_socket_addrs().map_err(resolution)?;
    addrs.next().map(|a| a.ip()).ok_or_else(|| {
        resolution(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no addresses",
        ))
    })
}

/// Builds an [`RdmaNode`].
pub struct RdmaNodeBuilder<F: Fabric> {
    fabric: Arc<F>,
    host: String,
    client_mode: bool,
    config: NodeConfig,
    listener: Option<Arc<dyn CompletionListener>>,
    factory: Arc<dyn ChannelFactory<F>>,
    selector: Arc<dyn CompletionVectorSelector>,
}

impl<F: Fabric> RdmaNodeBuilder<F> {
    /// Host name or IP to bind. Defaults to `127.0.0.1`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Client-mode nodes bind and listen but run no accept thread.
    pub fn client_mode(mut self, client_mode: bool) -> Self {
        self.client_mode = client_mode;
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Listener handed to passive channels.
    pub fn completion_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn channel_factory(mut self, factory: Arc<dyn ChannelFactory<F>>) -> Self {
        self.factory = factory;
        self
    }

    pub fn vector_selector(mut self, selector: Arc<dyn CompletionVectorSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Acquire the node's resources and, unless in client mode, start the
    /// accept thread. On failure everything acquired so far is released
    /// before the error is returned.
    pub fn build(self) -> Result<RdmaNode<F>> {
        self.config.validate()?;

        let shared = Arc::new(NodeShared {
            fabric: self.fabric,
            config: Arc::new(self.config),
            factory: self.factory,
            selector: self.selector,
            listener: self.listener,
            active: ActiveRegistry::new(),
            passive: PassiveRegistry::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            accept_state: Mutex::new(AcceptLoopState::NotStarted),
            resources: Mutex::new(NodeResources::default()),
            local_addr: Mutex::new(None),
        });

        let (local_addr, buffers) = match shared.open(&self.host) {
            Ok(opened) => opened,
            Err(NodeError::NativeBindingMissing(msg)) => {
                tracing::error!(
                    "native RDMA library not found; it must be installed on every host: {}",
                    msg
                );
                shared.stopped.store(true, Ordering::Release);
                return Err(NodeError::NativeBindingMissing(msg));
            }
            Err(e) => {
                tracing::error!(host = %self.host, "failed to start rdma node: {}", e);
                shared.stopped.store(true, Ordering::Release);
                shutdown::shutdown(&shared, None);
                return Err(e);
            }
        };

        let accept_thread = if self.client_mode {
            None
        } else {
            Some(spawn_accept_thread(&shared)?)
        };

        tracing::info!(
            %local_addr,
            client_mode = self.client_mode,
            fabric = shared.fabric.name(),
            "rdma node started"
        );

        Ok(RdmaNode {
            shared,
            local_addr,
            buffers,
            client_mode: self.client_mode,
            accept_thread: Mutex::new(accept_thread),
        })
    }
}

fn spawn_accept_thread<F: Fabric>(shared: &Arc<NodeShared<F>>) -> Result<JoinHandle<()>> {
    let events = shared
        .resources
        .lock()
        .event_channel
        .clone()
        .ok_or(NodeError::Stopped)?;

    shared.running.store(true, Ordering::Release);
    let loop_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("rnode-accept".into())
        .spawn(move || accept::run(loop_shared, events));

    spawned.map_err(|e| {
        tracing::error!("failed to spawn accept thread: {}", e);
        shared.running.store(false, Ordering::Release);
        shared.stopped.store(true, Ordering::Release);
        shutdown::shutdown(shared, None);
        NodeError::AcceptThread(e)
    })
}

/// An RDMA connection-manager endpoint.
pub struct RdmaNode<F: Fabric> {
    shared: Arc<NodeShared<F>>,
    local_addr: SocketAddr,
    buffers: Arc<RdmaBufferManager<F::Pd>>,
    client_mode: bool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Fabric> RdmaNode<F> {
    pub fn builder(fabric: F) -> RdmaNodeBuilder<F> {
        RdmaNodeBuilder {
            fabric: Arc::new(fabric),
            host: "127.0.0.1".to_string(),
            client_mode: false,
            config: NodeConfig::default(),
            listener: None,
            factory: Arc::new(VerbsChannelFactory),
            selector: Arc::new(FixedVector::default()),
        }
    }

    /// Start a node bound to `host`.
    pub fn new(
        fabric: F,
        host: &str,
        client_mode: bool,
        config: NodeConfig,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<Self> {
        let mut builder = Self::builder(fabric)
            .host(host)
            .client_mode(client_mode)
            .config(config);
        builder.listener = listener;
        builder.build()
    }

    /// Address the root id is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn buffer_manager(&self) -> &Arc<RdmaBufferManager<F::Pd>> {
        &self.buffers
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn fabric(&self) -> &F {
        &self.shared.fabric
    }

    pub fn is_client(&self) -> bool {
        self.client_mode
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn accept_loop_state(&self) -> AcceptLoopState {
        *self.shared.accept_state.lock()
    }

    /// Channels this node initiated.
    pub fn active(&self) -> &ActiveRegistry {
        &self.shared.active
    }

    /// Channels accepted from peers, with their host index.
    pub fn passive(&self) -> &PassiveRegistry {
        &self.shared.passive
    }

    /// Stop every channel, the accept thread, and release the node's
    /// resources. Calls after the first do nothing and return an empty
    /// report.
    pub fn stop(&self) -> StopReport {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return StopReport::default();
        }
        tracing::info!(local = %self.local_addr, "stopping rdma node");
        let accept_thread = self.accept_thread.lock().take();
        shutdown::shutdown(&self.shared, accept_thread)
    }
}

impl<F: Fabric> Drop for RdmaNode<F> {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop();
        }
    }
}
