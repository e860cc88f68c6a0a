//! Scripted channels for tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rnode_verbs::{CmId, Fabric, VerbsError};

use crate::channel::{ChannelFactory, ChannelRef, ChannelSpec, ChannelState, ChannelType, RdmaChannel};
use crate::error::ChannelError;

/// Behaviour shared by every channel a [`MockChannelFactory`] creates.
#[derive(Default)]
pub struct MockScript {
    pub fail_connect: AtomicBool,
    pub fail_accept: AtomicBool,
    pub fail_stop: AtomicBool,
    pub panic_on_accept: AtomicBool,
    /// Leave active channels connecting after `connect` returns.
    pub stall_connect: AtomicBool,
    /// Report success from `connect` but leave the channel in error state.
    pub break_after_connect: AtomicBool,
    pub connect_delay: Mutex<Duration>,
    pub connect_calls: AtomicUsize,
    pub accept_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

pub struct MockChannel {
    kind: ChannelType,
    script: Arc<MockScript>,
    state: Mutex<ChannelState>,
    changed: Condvar,
    peer: Mutex<Option<SocketAddr>>,
    pub finalize_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl MockChannel {
    pub fn new(kind: ChannelType, script: Arc<MockScript>, peer: Option<SocketAddr>) -> Self {
        Self {
            kind,
            script,
            state: Mutex::new(ChannelState::Created),
            changed: Condvar::new(),
            peer: Mutex::new(peer),
            finalize_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn passive() -> Self {
        Self::new(ChannelType::ReadResponder, Arc::default(), None)
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

impl RdmaChannel for MockChannel {
    fn kind(&self) -> ChannelType {
        self.kind
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), ChannelError> {
        self.script.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.peer.lock() = Some(addr);
        self.set_state(ChannelState::Connecting);

        let delay = *self.script.connect_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.script.fail_connect.load(Ordering::SeqCst) {
            self.set_state(ChannelState::Error);
            return Err(VerbsError::Rejected(addr).into());
        }
        if self.script.break_after_connect.load(Ordering::SeqCst) {
            self.set_state(ChannelState::Error);
            return Ok(());
        }
        if !self.script.stall_connect.load(Ordering::SeqCst) {
            self.set_state(ChannelState::Connected);
        }
        Ok(())
    }

    fn accept(&self) -> Result<(), ChannelError> {
        self.script.accept_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.panic_on_accept.load(Ordering::SeqCst) {
            panic!("scripted accept panic");
        }
        if self.script.fail_accept.load(Ordering::SeqCst) {
            self.set_state(ChannelState::Error);
            return Err(ChannelError::InvalidState("scripted accept failure".into()));
        }
        self.set_state(ChannelState::Connecting);
        Ok(())
    }

    fn finalize_connection(&self) {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Connected;
            self.changed.notify_all();
        }
    }

    fn stop(&self) -> Result<(), ChannelError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.script.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(ChannelState::Stopped);
        if self.script.fail_stop.load(Ordering::SeqCst) {
            return Err(ChannelError::InvalidState("scripted stop failure".into()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.state.lock() == ChannelState::Connected
    }

    fn is_error(&self) -> bool {
        *self.state.lock() == ChannelState::Error
    }

    fn wait_for_active_connection(&self) {
        let deadline = Instant::now() + Duration::from_millis(200);
        let mut state = self.state.lock();
        while matches!(*state, ChannelState::Created | ChannelState::Connecting) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }
}

/// Creates [`MockChannel`]s and remembers them.
#[derive(Default)]
pub struct MockChannelFactory {
    pub script: Arc<MockScript>,
    created: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockChannelFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<Arc<MockChannel>> {
        self.created.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn connect_calls(&self) -> usize {
        self.script.connect_calls.load(Ordering::SeqCst)
    }
}

impl<F: Fabric> ChannelFactory<F> for MockChannelFactory {
    fn create(&self, spec: ChannelSpec<F>) -> ChannelRef {
        let peer = spec.cm_id.as_ref().and_then(|id| id.destination());
        let channel = Arc::new(MockChannel::new(spec.kind, Arc::clone(&self.script), peer));
        self.created.lock().push(Arc::clone(&channel));
        channel
    }
}
