//! Connection registries.
//!
//! The active registry holds channels this node initiated; the passive
//! registry holds channels accepted from peers, plus a host index mapping a
//! peer's IP to the full address it connected from. Both are keyed by the
//! remote socket address and hold at most one channel per address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::channel::ChannelRef;

fn same(a: &ChannelRef, b: &ChannelRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// Key of the host index: the peer's IP as text.
pub fn host_key(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

/// Channels this node initiated.
#[derive(Default)]
pub struct ActiveRegistry {
    channels: DashMap<SocketAddr, ChannelRef>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<ChannelRef> {
        self.channels.get(addr).map(|c| Arc::clone(c.value()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.channels.iter().map(|e| *e.key()).collect()
    }

    /// Insert `channel` unless `addr` already has one. Returns the channel
    /// that ends up registered and whether it is the one passed in.
    pub(crate) fn insert_if_absent(
        &self,
        addr: SocketAddr,
        channel: ChannelRef,
    ) -> (ChannelRef, bool) {
        match self.channels.entry(addr) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&channel));
                (channel, true)
            }
        }
    }

    /// Remove the entry for `addr` only if it still holds `channel`.
    pub(crate) fn remove_if_same(&self, addr: &SocketAddr, channel: &ChannelRef) -> bool {
        self.channels
            .remove_if(addr, |_, current| same(current, channel))
            .is_some()
    }

    /// Remove every entry and return the channels.
    pub(crate) fn drain(&self) -> Vec<ChannelRef> {
        let addrs = self.addrs();
        addrs
            .iter()
            .filter_map(|addr| self.channels.remove(addr).map(|(_, c)| c))
            .collect()
    }
}

/// Channels accepted from peers, with a host index.
///
/// Only the accept loop and the shutdown path mutate this registry; other
/// threads read it, and may block in [`wait_for_host`](Self::wait_for_host)
/// until a peer's channel is established.
#[derive(Default)]
pub struct PassiveRegistry {
    channels: DashMap<SocketAddr, ChannelRef>,
    hosts: DashMap<String, SocketAddr>,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl PassiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<ChannelRef> {
        self.channels.get(addr).map(|c| Arc::clone(c.value()))
    }

    /// Address the peer at `host` currently connects from.
    pub fn host_addr(&self, host: &str) -> Option<SocketAddr> {
        self.hosts.get(host).map(|a| *a.value())
    }

    /// Channel of the peer at `host`, whatever port it connected from.
    pub fn get_by_host(&self, host: &str) -> Option<ChannelRef> {
        self.host_addr(host).and_then(|addr| self.get(&addr))
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.channels.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot of the host index.
    pub fn hosts(&self) -> Vec<(String, SocketAddr)> {
        self.hosts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Wait until the peer at `host` has a connected channel, or `timeout`
    /// elapses.
    pub fn wait_for_host(&self, host: &str, timeout: Duration) -> Option<ChannelRef> {
        let ready = || self.get_by_host(host).filter(|c| c.is_connected());
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        loop {
            if let Some(channel) = ready() {
                return Some(channel);
            }
            if self.changed.wait_until(&mut generation, deadline).timed_out() {
                return ready();
            }
        }
    }

    /// Wake threads blocked in `wait_for_host`.
    pub(crate) fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Register `channel` for `addr` and index its host. Returns `false`
    /// without touching either map if `addr` already has a channel.
    pub(crate) fn insert_if_absent(&self, addr: SocketAddr, channel: ChannelRef) -> bool {
        match self.channels.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(channel);
                self.hosts.insert(host_key(&addr), addr);
                self.notify();
                true
            }
        }
    }

    /// Remove the channel for `addr` together with its host index entry.
    pub(crate) fn remove(&self, addr: &SocketAddr) -> Option<ChannelRef> {
        let removed = self.channels.remove(addr).map(|(_, c)| c);
        self.unindex(addr);
        if removed.is_some() {
            self.notify();
        }
        removed
    }

    /// Like [`remove`](Self::remove), but only if `addr` still holds `channel`.
    pub(crate) fn remove_if_same(&self, addr: &SocketAddr, channel: &ChannelRef) -> bool {
        let removed = self
            .channels
            .remove_if(addr, |_, current| same(current, channel))
            .is_some();
        if removed {
            self.unindex(addr);
            self.notify();
        }
        removed
    }

    /// Drop the host index entry for `addr` unless it now points at a
    /// newer connection from the same host.
    fn unindex(&self, addr: &SocketAddr) {
        self.hosts.remove_if(&host_key(addr), |_, indexed| indexed == addr);
    }

    /// Remove every channel and clear the host index.
    pub(crate) fn drain(&self) -> Vec<ChannelRef> {
        let addrs = self.addrs();
        let drained = addrs
            .iter()
            .filter_map(|addr| self.channels.remove(addr).map(|(_, c)| c))
            .collect();
        self.hosts.clear();
        self.notify();
        drained
    }
}
