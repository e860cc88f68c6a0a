//! Registered buffer manager.
//!
//! Buffers are registered against the node's protection domain and kept in
//! power-of-two size classes. Each class is a lock-free `ArrayQueue`; a
//! buffer returned to a full class is deregistered and freed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use rnode_verbs::{MemoryRegion, ProtectionDomain};

use crate::config::NodeConfig;
use crate::error::BufferError;

/// A buffer registered with the protection domain.
pub struct RegisteredBuffer {
    data: Vec<u8>,
    region: MemoryRegion,
    class: usize,
}

impl RegisteredBuffer {
    /// Registered address of the first byte.
    pub fn addr(&self) -> u64 {
        self.region.addr
    }

    pub fn lkey(&self) -> u32 {
        self.region.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.region.rkey
    }

    /// Capacity of the buffer, which is the size of its class.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for RegisteredBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBuffer")
            .field("addr", &format_args!("{:#x}", self.region.addr))
            .field("len", &self.data.len())
            .field("lkey", &self.region.lkey)
            .finish()
    }
}

/// Hands out registered buffers for data-path use.
pub struct RdmaBufferManager<P: ProtectionDomain> {
    pd: Arc<P>,
    min_size: usize,
    max_size: usize,
    classes: Vec<ArrayQueue<RegisteredBuffer>>,
    outstanding: AtomicUsize,
    stopped: AtomicBool,
}

impl<P: ProtectionDomain> RdmaBufferManager<P> {
    pub fn new(pd: Arc<P>, config: &NodeConfig) -> Self {
        let min_size = config.min_buffer_size.max(1).next_power_of_two();
        let max_size = config.max_buffer_size.max(min_size).next_power_of_two();
        let class_count = (max_size / min_size).trailing_zeros() as usize + 1;
        let capacity = config.buffer_pool_capacity.max(1);
        Self {
            pd,
            min_size,
            max_size,
            classes: (0..class_count).map(|_| ArrayQueue::new(capacity)).collect(),
            outstanding: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn pd(&self) -> &Arc<P> {
        &self.pd
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn class_of(&self, len: usize) -> usize {
        let size = len.max(self.min_size).next_power_of_two();
        (size / self.min_size).trailing_zeros() as usize
    }

    /// Get a buffer of at least `len` bytes, reusing a pooled one if possible.
    pub fn get(&self, len: usize) -> Result<RegisteredBuffer, BufferError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BufferError::Stopped);
        }
        if len > self.max_size {
            return Err(BufferError::TooLarge {
                requested: len,
                max: self.max_size,
            });
        }

        let class = self.class_of(len);
        let buf = match self.classes[class].pop() {
            Some(buf) => buf,
            None => {
                let data = vec![0u8; self.min_size << class];
                let region = self.pd.register(data.as_ptr() as u64, data.len())?;
                tracing::trace!(len = data.len(), lkey = region.lkey, "registered buffer");
                RegisteredBuffer {
                    data,
                    region,
                    class,
                }
            }
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(buf)
    }

    /// Return a buffer to its pool.
    pub fn put(&self, buf: RegisteredBuffer) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.stopped.load(Ordering::Acquire) {
            self.release(buf);
            return;
        }
        if let Err(buf) = self.classes[buf.class].push(buf) {
            self.release(buf);
        }
    }

    fn release(&self, buf: RegisteredBuffer) {
        if let Err(e) = self.pd.deregister(&buf.region) {
            tracing::warn!(lkey = buf.region.lkey, "failed to deregister buffer: {}", e);
        }
    }

    /// Number of buffers currently pooled across all classes.
    pub fn pooled(&self) -> usize {
        self.classes.iter().map(ArrayQueue::len).sum()
    }

    /// Number of buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Deregister every pooled buffer. Buffers still out are deregistered
    /// when they are returned. Returns how many buffers were released.
    pub fn stop(&self) -> usize {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut released = 0;
        for class in &self.classes {
            while let Some(buf) = class.pop() {
                self.release(buf);
                released += 1;
            }
        }
        let outstanding = self.outstanding();
        if outstanding > 0 {
            tracing::warn!(outstanding, "buffer manager stopped with buffers in use");
        }
        tracing::debug!(released, "buffer manager stopped");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnode_verbs::{CmId, Fabric, LoopbackFabric, PortSpace, VerbsContext};

    fn manager(fabric: &LoopbackFabric, config: &NodeConfig) -> RdmaBufferManager<rnode_verbs::LoopbackPd> {
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&channel, PortSpace::Tcp).unwrap();
        id.bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        let pd = id.verbs().unwrap().alloc_pd().unwrap();
        RdmaBufferManager::new(Arc::new(pd), config)
    }

    fn small_config() -> NodeConfig {
        NodeConfig {
            min_buffer_size: 1024,
            max_buffer_size: 8192,
            buffer_pool_capacity: 2,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_size_classes() {
        let fabric = LoopbackFabric::default();
        let mgr = manager(&fabric, &small_config());
        assert_eq!(mgr.get(1).unwrap().len(), 1024);
        assert_eq!(mgr.get(1025).unwrap().len(), 2048);
        assert_eq!(mgr.get(8192).unwrap().len(), 8192);
        assert!(matches!(
            mgr.get(8193),
            Err(BufferError::TooLarge { max: 8192, .. })
        ));
    }

    #[test]
    fn test_reuse() {
        let fabric = LoopbackFabric::default();
        let mgr = manager(&fabric, &small_config());
        let buf = mgr.get(100).unwrap();
        let lkey = buf.lkey();
        assert_eq!(mgr.outstanding(), 1);
        mgr.put(buf);
        assert_eq!(mgr.pooled(), 1);
        assert_eq!(mgr.get(900).unwrap().lkey(), lkey);
        assert_eq!(fabric.live_regions(), 1);
    }

    #[test]
    fn test_full_class_deregisters() {
        let fabric = LoopbackFabric::default();
        let mgr = manager(&fabric, &small_config());
        let bufs: Vec<_> = (0..3).map(|_| mgr.get(10).unwrap()).collect();
        assert_eq!(fabric.live_regions(), 3);
        for buf in bufs {
            mgr.put(buf);
        }
        assert_eq!(mgr.pooled(), 2);
        assert_eq!(fabric.live_regions(), 2);
    }

    #[test]
    fn test_stop() {
        let fabric = LoopbackFabric::default();
        let mgr = manager(&fabric, &small_config());
        let held = mgr.get(10).unwrap();
        let pooled = mgr.get(10).unwrap();
        mgr.put(pooled);

        assert_eq!(mgr.stop(), 1);
        assert_eq!(mgr.stop(), 0);
        assert!(matches!(mgr.get(10), Err(BufferError::Stopped)));
        assert_eq!(fabric.live_regions(), 1);

        mgr.put(held);
        assert_eq!(fabric.live_regions(), 0);
    }

    #[test]
    fn test_buffer_is_writable() {
        let fabric = LoopbackFabric::default();
        let mgr = manager(&fabric, &small_config());
        let mut buf = mgr.get(16).unwrap();
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert_eq!(buf.addr(), buf.as_slice().as_ptr() as u64);
    }
}
