//! Node teardown.
//!
//! Teardown runs in four barriers: stop every active channel, join the
//! accept thread, stop every passive channel, then release node-level
//! resources. Channels are stopped in parallel on a bounded set of scoped
//! worker threads; a failing (or panicking) stop is logged and counted, and
//! never interrupts the rest of the batch.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use rnode_verbs::{CmId, EventChannel, Fabric, ProtectionDomain};

use crate::buffer::RdmaBufferManager;
use crate::channel::ChannelRef;
use crate::node::NodeShared;

/// What a call to [`RdmaNode::stop`](crate::RdmaNode::stop) did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub active_stopped: usize,
    pub passive_stopped: usize,
    /// Channels whose `stop` returned an error or panicked.
    pub stop_failures: usize,
    pub accept_thread_joined: bool,
    pub buffers_released: usize,
    /// Node-level resources released (protection domain, root id, event
    /// channel).
    pub resources_released: usize,
}

impl StopReport {
    pub fn channels_stopped(&self) -> usize {
        self.active_stopped + self.passive_stopped
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Stop one channel, logging any failure. Returns whether it stopped cleanly.
pub(crate) fn stop_channel(channel: &ChannelRef) -> bool {
    match catch_unwind(AssertUnwindSafe(|| channel.stop())) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(peer = ?channel.peer(), "exception caught while stopping channel: {}", e);
            false
        }
        Err(panic) => {
            tracing::error!(
                peer = ?channel.peer(),
                "channel stop panicked: {}",
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

/// Stop `channels` on at most `workers` threads and wait for all of them.
/// Returns the number of failed stops.
pub(crate) fn stop_all(channels: Vec<ChannelRef>, workers: usize, registry: &str) -> usize {
    if channels.is_empty() {
        return 0;
    }
    let total = channels.len();
    let workers = workers.clamp(1, total);
    let queue = ArrayQueue::new(total);
    for channel in channels {
        // Capacity equals the number of channels.
        let _ = queue.push(channel);
    }
    let failures = AtomicUsize::new(0);

    let drain = || {
        while let Some(channel) = queue.pop() {
            if !stop_channel(&channel) {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    let scoped = crossbeam::scope(|s| {
        for _ in 0..workers {
            s.spawn(|_| drain());
        }
    });
    if scoped.is_err() {
        tracing::error!(registry, "channel stop worker panicked");
    }
    // Anything a dead worker left behind is stopped inline.
    drain();

    let failures = failures.into_inner();
    tracing::debug!(registry, total, workers, failures, "channels stopped");
    failures
}

/// Node-level resources, each present only once acquired.
pub(crate) struct NodeResources<F: Fabric> {
    pub(crate) event_channel: Option<Arc<F::EventChannel>>,
    pub(crate) listen_id: Option<F::CmId>,
    pub(crate) pd: Option<Arc<F::Pd>>,
    pub(crate) buffers: Option<Arc<RdmaBufferManager<F::Pd>>>,
}

impl<F: Fabric> Default for NodeResources<F> {
    fn default() -> Self {
        Self {
            event_channel: None,
            listen_id: None,
            pd: None,
            buffers: None,
        }
    }
}

impl<F: Fabric> NodeResources<F> {
    /// Release in order: buffers, protection domain, root id, event channel.
    fn release(self, report: &mut StopReport) {
        if let Some(buffers) = self.buffers {
            report.buffers_released = buffers.stop();
        }
        if let Some(pd) = self.pd {
            match pd.dealloc() {
                Ok(()) => report.resources_released += 1,
                Err(e) => tracing::warn!("failed to deallocate protection domain: {}", e),
            }
        }
        if let Some(id) = self.listen_id {
            match id.destroy() {
                Ok(()) => report.resources_released += 1,
                Err(e) => tracing::warn!("failed to destroy listener id: {}", e),
            }
        }
        if let Some(events) = self.event_channel {
            match events.destroy() {
                Ok(()) => report.resources_released += 1,
                Err(e) => tracing::warn!("failed to destroy event channel: {}", e),
            }
        }
    }
}

/// Tear down everything `shared` owns.
pub(crate) fn shutdown<F: Fabric>(
    shared: &NodeShared<F>,
    accept_thread: Option<JoinHandle<()>>,
) -> StopReport {
    let mut report = StopReport::default();
    let workers = shared.config.shutdown_workers;

    let active = shared.active.drain();
    report.active_stopped = active.len();
    report.stop_failures += stop_all(active, workers, "active");

    if shared.running.swap(false, Ordering::AcqRel) {
        if let Some(handle) = accept_thread {
            if handle.join().is_err() {
                tracing::error!("accept thread panicked");
            }
            report.accept_thread_joined = true;
        }
    }

    let passive = shared.passive.drain();
    report.passive_stopped = passive.len();
    report.stop_failures += stop_all(passive, workers, "passive");

    let resources = std::mem::take(&mut *shared.resources.lock());
    resources.release(&mut report);

    tracing::info!(
        active = report.active_stopped,
        passive = report.passive_stopped,
        failures = report.stop_failures,
        "rdma node stopped"
    );
    report
}
