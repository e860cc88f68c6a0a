//! Channel backed by a fabric's CM ids.
//!
//! An active channel owns a private event channel and walks the usual
//! `resolve_addr -> resolve_route -> connect` handshake, waiting for each
//! CM event within the per-attempt timeout. A passive channel wraps the id
//! delivered with a connect request; its events arrive on the node's event
//! channel and are forwarded by the accept loop (`finalize_connection`).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rnode_verbs::{CmEvent, CmEventType, CmId, EventChannel, Fabric, PortSpace};

use crate::buffer::RdmaBufferManager;
use crate::channel::{ChannelSpec, ChannelState, ChannelType, CompletionListener, RdmaChannel};
use crate::config::NodeConfig;
use crate::error::ChannelError;

struct Inner<F: Fabric> {
    state: ChannelState,
    cm_id: Option<F::CmId>,
    /// Private event channel of an active channel.
    events: Option<Arc<F::EventChannel>>,
    peer: Option<SocketAddr>,
}

pub struct VerbsChannel<F: Fabric> {
    kind: ChannelType,
    fabric: Arc<F>,
    config: Arc<NodeConfig>,
    buffers: Arc<RdmaBufferManager<F::Pd>>,
    listener: Option<Arc<dyn CompletionListener>>,
    completion_vector: u32,
    local_ip: Option<IpAddr>,
    inner: Mutex<Inner<F>>,
    changed: Condvar,
}

impl<F: Fabric> VerbsChannel<F> {
    pub fn new(spec: ChannelSpec<F>) -> Self {
        let peer = spec.cm_id.as_ref().and_then(|id| id.destination());
        Self {
            kind: spec.kind,
            fabric: spec.fabric,
            config: spec.config,
            buffers: spec.buffers,
            listener: spec.listener,
            completion_vector: spec.completion_vector,
            local_ip: spec.local_ip,
            inner: Mutex::new(Inner {
                state: ChannelState::Created,
                cm_id: spec.cm_id,
                events: None,
                peer,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn buffers(&self) -> &Arc<RdmaBufferManager<F::Pd>> {
        &self.buffers
    }

    pub fn completion_vector(&self) -> u32 {
        self.completion_vector
    }

    fn set_state(&self, inner: &mut Inner<F>, state: ChannelState) {
        inner.state = state;
        self.changed.notify_all();
    }

    fn fail(&self, err: &ChannelError) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Stopped {
                return;
            }
            self.set_state(&mut inner, ChannelState::Error);
        }
        if self.kind.is_passive() {
            if let Some(listener) = &self.listener {
                listener.on_failure(err);
            }
        }
    }

    fn expect_event(
        &self,
        events: &F::EventChannel,
        expected: CmEventType,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let event = events
            .get_cm_event(timeout)?
            .ok_or(ChannelError::Timeout(expected))?;
        let got = event.event_type();
        event.ack();
        if got != expected {
            return Err(ChannelError::UnexpectedEvent { expected, got });
        }
        Ok(())
    }

    fn handshake(&self, addr: SocketAddr) -> Result<(), ChannelError> {
        let timeout = self.config.cm_event_timeout();
        let events = self.fabric.create_event_channel()?;
        let id = match self.fabric.create_id(&events, PortSpace::Tcp) {
            Ok(id) => id,
            Err(e) => {
                let _ = events.destroy();
                return Err(e.into());
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Stopped {
                drop(inner);
                let _ = id.destroy();
                let _ = events.destroy();
                return Err(ChannelError::Stopped);
            }
            inner.cm_id = Some(id.clone());
            inner.events = Some(Arc::clone(&events));
        }

        let src = self.local_ip.map(|ip| SocketAddr::new(ip, 0));
        id.resolve_addr(src, addr, timeout)?;
        self.expect_event(&events, CmEventType::AddrResolved, timeout)?;
        id.resolve_route(timeout)?;
        self.expect_event(&events, CmEventType::RouteResolved, timeout)?;
        tracing::debug!(
            peer = %addr,
            send_queue_depth = self.config.send_queue_depth,
            recv_queue_depth = self.config.recv_queue_depth,
            vector = self.completion_vector,
            "route resolved, connecting"
        );
        id.connect(&self.config.conn_param())?;
        self.expect_event(&events, CmEventType::Established, timeout)
    }

    /// Drain pending events of an active channel; a disconnect or failure
    /// event moves a connected channel to `Error`.
    fn poll_disconnect(&self) {
        let events = {
            let inner = self.inner.lock();
            if inner.state != ChannelState::Connected {
                return;
            }
            match &inner.events {
                Some(events) => Arc::clone(events),
                None => return,
            }
        };

        let mut broken = false;
        while let Ok(Some(event)) = events.get_cm_event(Duration::ZERO) {
            let kind = event.event_type();
            event.ack();
            if kind == CmEventType::Disconnected || kind.is_failure() {
                broken = true;
            }
        }
        if broken {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Connected {
                tracing::info!(peer = ?inner.peer, "peer disconnected");
                self.set_state(&mut inner, ChannelState::Error);
            }
        }
    }
}

impl<F: Fabric> RdmaChannel for VerbsChannel<F> {
    fn kind(&self) -> ChannelType {
        self.kind
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), ChannelError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::Created {
                return Err(ChannelError::InvalidState(format!(
                    "connect in state {:?}",
                    inner.state
                )));
            }
            inner.peer = Some(addr);
            self.set_state(&mut inner, ChannelState::Connecting);
        }

        match self.handshake(addr) {
            Ok(()) => {
                let mut inner = self.inner.lock();
                if inner.state == ChannelState::Stopped {
                    return Err(ChannelError::Stopped);
                }
                self.set_state(&mut inner, ChannelState::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(peer = %addr, "connect failed: {}", e);
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn accept(&self) -> Result<(), ChannelError> {
        if !self.kind.is_passive() {
            return Err(ChannelError::NotPassive);
        }
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.cm_id.clone().ok_or(ChannelError::NotPassive)?;
            if inner.state != ChannelState::Created {
                return Err(ChannelError::InvalidState(format!(
                    "accept in state {:?}",
                    inner.state
                )));
            }
            self.set_state(&mut inner, ChannelState::Connecting);
            id
        };

        if let Err(e) = id.accept(&self.config.conn_param()) {
            let err = ChannelError::from(e);
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    fn finalize_connection(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Connecting {
            self.set_state(&mut inner, ChannelState::Connected);
        }
    }

    fn stop(&self) -> Result<(), ChannelError> {
        let (previous, id, events) = {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Stopped {
                return Ok(());
            }
            let previous = inner.state;
            self.set_state(&mut inner, ChannelState::Stopped);
            (previous, inner.cm_id.take(), inner.events.take())
        };

        let mut result = Ok(());
        if let Some(id) = id {
            if matches!(previous, ChannelState::Connected | ChannelState::Connecting) {
                if let Err(e) = id.disconnect() {
                    result = Err(e.into());
                }
            }
            if let Err(e) = id.destroy() {
                result = result.and(Err(e.into()));
            }
        }
        if let Some(events) = events {
            if let Err(e) = events.destroy() {
                result = result.and(Err(e.into()));
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.poll_disconnect();
        self.inner.lock().state == ChannelState::Connected
    }

    fn is_error(&self) -> bool {
        self.poll_disconnect();
        self.inner.lock().state == ChannelState::Error
    }

    fn wait_for_active_connection(&self) {
        let deadline = Instant::now() + self.config.cm_event_timeout();
        let mut inner = self.inner.lock();
        while matches!(inner.state, ChannelState::Created | ChannelState::Connecting) {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
    }

    fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.inner.lock().peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnode_verbs::{ConnParam, LoopbackFabric, VerbsContext};

    const TIMEOUT: Duration = Duration::from_millis(500);

    struct Env {
        fabric: Arc<LoopbackFabric>,
        config: Arc<NodeConfig>,
        buffers: Arc<RdmaBufferManager<rnode_verbs::LoopbackPd>>,
    }

    fn env() -> Env {
        let fabric = Arc::new(LoopbackFabric::default());
        let config = Arc::new(NodeConfig {
            rdma_cm_event_timeout_ms: 200,
            ..NodeConfig::default()
        });
        let events = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&events, PortSpace::Tcp).unwrap();
        id.bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        let pd = id.verbs().unwrap().alloc_pd().unwrap();
        let buffers = Arc::new(RdmaBufferManager::new(Arc::new(pd), &config));
        Env {
            fabric,
            config,
            buffers,
        }
    }

    fn spec(env: &Env, kind: ChannelType, cm_id: Option<rnode_verbs::LoopbackCmId>) -> ChannelSpec<LoopbackFabric> {
        ChannelSpec {
            kind,
            fabric: Arc::clone(&env.fabric),
            config: Arc::clone(&env.config),
            buffers: Arc::clone(&env.buffers),
            listener: None,
            cm_id,
            completion_vector: 0,
            local_ip: Some("10.0.0.2".parse().unwrap()),
        }
    }

    fn listen(
        fabric: &LoopbackFabric,
        at: &str,
    ) -> (Arc<rnode_verbs::LoopbackEventChannel>, rnode_verbs::LoopbackCmId) {
        let events = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&events, PortSpace::Tcp).unwrap();
        id.bind_addr(at.parse().unwrap()).unwrap();
        id.listen(128).unwrap();
        (events, id)
    }

    /// Accept one request on `events` from a helper thread.
    fn serve_one(events: Arc<rnode_verbs::LoopbackEventChannel>) -> std::thread::JoinHandle<rnode_verbs::LoopbackCmId> {
        std::thread::spawn(move || {
            let event = events.get_cm_event(TIMEOUT).unwrap().expect("request");
            assert_eq!(event.event_type(), CmEventType::ConnectRequest);
            let id = event.conn_id();
            event.ack();
            id.accept(&ConnParam::default()).unwrap();
            id
        })
    }

    #[test]
    fn test_active_connect_and_stop() {
        let env = env();
        let (events, _listener) = listen(&env.fabric, "10.0.0.1:1955");
        let server = serve_one(events);

        let channel = VerbsChannel::new(spec(&env, ChannelType::ReadRequestor, None));
        channel.connect("10.0.0.1:1955".parse().unwrap()).unwrap();
        assert!(channel.is_connected());
        assert_eq!(channel.peer(), Some("10.0.0.1:1955".parse().unwrap()));
        let passive = server.join().unwrap();
        assert!(passive.is_connected());

        let live = env.fabric.live_ids();
        channel.stop().unwrap();
        channel.stop().unwrap();
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert_eq!(env.fabric.live_ids(), live - 1);
        assert!(!passive.is_connected());
    }

    #[test]
    fn test_connect_rejected() {
        let env = env();
        let channel = VerbsChannel::new(spec(&env, ChannelType::ReadRequestor, None));
        let err = channel.connect("10.0.0.1:1955".parse().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::UnexpectedEvent {
                expected: CmEventType::Established,
                got: CmEventType::Rejected
            }
        ));
        assert!(channel.is_error());
        channel.stop().unwrap();
        assert_eq!(env.fabric.live_event_channels(), 1);
    }

    #[test]
    fn test_connect_timeout_without_accept() {
        let env = env();
        let (_events, _listener) = listen(&env.fabric, "10.0.0.1:1955");
        let channel = VerbsChannel::new(spec(&env, ChannelType::ReadRequestor, None));
        let err = channel.connect("10.0.0.1:1955".parse().unwrap()).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(CmEventType::Established)));
        assert!(channel.is_error());
    }

    #[test]
    fn test_connect_twice_is_invalid() {
        let env = env();
        let channel = VerbsChannel::new(spec(&env, ChannelType::ReadRequestor, None));
        let _ = channel.connect("10.0.0.1:1955".parse().unwrap());
        assert!(matches!(
            channel.connect("10.0.0.1:1955".parse().unwrap()),
            Err(ChannelError::InvalidState(_))
        ));
    }

    #[test]
    fn test_peer_disconnect_turns_active_channel_to_error() {
        let env = env();
        let (events, _listener) = listen(&env.fabric, "10.0.0.1:1955");
        let server = serve_one(events);
        let channel = VerbsChannel::new(spec(&env, ChannelType::ReadRequestor, None));
        channel.connect("10.0.0.1:1955".parse().unwrap()).unwrap();
        let passive = server.join().unwrap();

        passive.disconnect().unwrap();
        assert!(!channel.is_connected());
        assert!(channel.is_error());
    }

    #[test]
    fn test_passive_accept_and_finalize() {
        let env = env();
        let (events, _listener) = listen(&env.fabric, "10.0.0.1:1955");
        let client = VerbsChannel::new(spec(&env, ChannelType::ReadRequestor, None));
        let client = Arc::new(client);
        let connecting = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.connect("10.0.0.1:1955".parse().unwrap()))
        };

        let event = events.get_cm_event(TIMEOUT).unwrap().expect("request");
        let id = event.conn_id();
        event.ack();
        let passive = VerbsChannel::new(spec(&env, ChannelType::ReadResponder, Some(id)));
        // The env's own bind took the first ephemeral port.
        let client_source = SocketAddr::new(
            "10.0.0.2".parse().unwrap(),
            rnode_verbs::loopback::EPHEMERAL_PORT_START + 1,
        );
        assert_eq!(passive.peer(), Some(client_source));
        passive.accept().unwrap();
        assert_eq!(passive.state(), ChannelState::Connecting);
        passive.finalize_connection();
        assert!(passive.is_connected());

        connecting.join().unwrap().unwrap();
        assert!(client.is_connected());
    }

    #[test]
    fn test_accept_on_active_channel() {
        let env = env();
        let channel = VerbsChannel::new(spec(&env, ChannelType::ReadRequestor, None));
        assert!(matches!(channel.accept(), Err(ChannelError::NotPassive)));
    }

    #[test]
    fn test_failed_accept_notifies_listener() {
        struct Recorder(Mutex<Vec<String>>);
        impl CompletionListener for Recorder {
            fn on_success(&self, _data: &[u8]) {}
            fn on_failure(&self, err: &ChannelError) {
                self.0.lock().push(err.to_string());
            }
        }

        let env = env();
        let (events, _listener) = listen(&env.fabric, "10.0.0.1:1955");
        let id = env
            .fabric
            .post_event(
                "10.0.0.1:1955".parse().unwrap(),
                CmEventType::ConnectRequest,
                "10.0.0.9:5000".parse().unwrap(),
            )
            .unwrap();
        let _ = events.get_cm_event(TIMEOUT).unwrap().map(|e| e.ack());

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut spec = spec(&env, ChannelType::ReadResponder, Some(id));
        spec.listener = Some(recorder.clone());
        let passive = VerbsChannel::new(spec);
        assert!(passive.accept().is_err());
        assert!(passive.is_error());
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn test_wait_returns_after_timeout() {
        let env = env();
        let (events, _listener) = listen(&env.fabric, "10.0.0.1:1955");
        let id = env
            .fabric
            .post_event(
                "10.0.0.1:1955".parse().unwrap(),
                CmEventType::ConnectRequest,
                "10.0.0.9:5000".parse().unwrap(),
            )
            .unwrap();
        let _ = events.get_cm_event(TIMEOUT).unwrap().map(|e| e.ack());
        let passive = VerbsChannel::new(spec(&env, ChannelType::ReadResponder, Some(id)));

        let start = Instant::now();
        passive.wait_for_active_connection();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(passive.state(), ChannelState::Created);
    }
}
