use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use rnode_verbs::Fabric;

use super::RdmaNode;
use crate::channel::{ChannelRef, ChannelType};
use crate::error::{ChannelError, NodeError, Result};
use crate::shutdown::stop_channel;

impl<F: Fabric> RdmaNode<F> {
    /// Return the established channel to `addr`, connecting one if none is
    /// registered.
    ///
    /// Concurrent callers for the same address share a single channel: only
    /// the caller whose channel wins the registry insert runs `connect`, the
    /// others wait on that channel. A channel found in error state is removed
    /// and replaced.
    ///
    /// With `must_retry`, failed connects are retried up to
    /// `max_connection_attempts` times within `connection_deadline()`, after
    /// which [`NodeError::ConnectTimeout`] is returned. Without it, a failed
    /// connect is returned as [`NodeError::Connect`], and a channel that is
    /// still connecting after one wait is returned as is. A channel this call
    /// connected that is already in error state counts as a failed connect.
    pub fn get_rdma_channel(&self, addr: SocketAddr, must_retry: bool) -> Result<ChannelRef> {
        let shared = &self.shared;
        let active = &shared.active;
        let max_attempts = shared.config.max_connection_attempts;
        let deadline = shared.config.connection_deadline();
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut replaced = 0u32;

        loop {
            if shared.stopped.load(Ordering::Acquire) {
                return Err(NodeError::Stopped);
            }

            let mut fresh = false;
            let channel = match active.get(&addr) {
                Some(channel) => channel,
                None => {
                    let created = shared.new_channel(ChannelType::ReadRequestor, None, Some(addr))?;
                    let (channel, inserted) = active.insert_if_absent(addr, created);
                    if !inserted {
                        tracing::debug!(peer = %addr, "lost race creating channel, reusing winner");
                        channel
                    } else if shared.stopped.load(Ordering::Acquire) {
                        active.remove_if_same(&addr, &channel);
                        stop_channel(&channel);
                        return Err(NodeError::Stopped);
                    } else {
                        match channel.connect(addr) {
                            Ok(()) => {
                                fresh = true;
                                tracing::info!(
                                    peer = %addr,
                                    elapsed_ms = start.elapsed().as_millis() as u64,
                                    "established connection"
                                );
                                channel
                            }
                            Err(e) => {
                                attempts += 1;
                                active.remove_if_same(&addr, &channel);
                                stop_channel(&channel);

                                if !must_retry {
                                    tracing::error!(peer = %addr, "failed to connect: {}", e);
                                    return Err(NodeError::Connect { addr, source: e });
                                }
                                if attempts >= max_attempts {
                                    tracing::error!(
                                        peer = %addr,
                                        attempts,
                                        "failed to connect, aborting: {}",
                                        e
                                    );
                                    return Err(NodeError::ConnectTimeout { addr, attempts });
                                }
                                tracing::warn!(
                                    peer = %addr,
                                    attempt = attempts,
                                    max_attempts,
                                    "failed to connect: {}",
                                    e
                                );
                                if start.elapsed() >= deadline {
                                    break;
                                }
                                continue;
                            }
                        }
                    }
                }
            };

            if channel.is_error() {
                active.remove_if_same(&addr, &channel);
                stop_channel(&channel);

                if fresh {
                    // Connected by this call and broken before it could be returned.
                    attempts += 1;
                    if !must_retry {
                        tracing::error!(peer = %addr, "connection failed right after connect");
                        return Err(NodeError::Connect {
                            addr,
                            source: ChannelError::InvalidState(
                                "connection entered error state after connect".into(),
                            ),
                        });
                    }
                    if attempts >= max_attempts {
                        tracing::error!(peer = %addr, attempts, "connection keeps failing, aborting");
                        return Err(NodeError::ConnectTimeout { addr, attempts });
                    }
                    tracing::warn!(peer = %addr, attempt = attempts, max_attempts, "connection failed right after connect");
                } else {
                    replaced += 1;
                    if replaced > max_attempts {
                        break;
                    }
                    tracing::info!(peer = %addr, "replacing connection in error state");
                }
                if start.elapsed() >= deadline {
                    break;
                }
                continue;
            }

            if !channel.is_connected() {
                channel.wait_for_active_connection();
            }

            if channel.is_connected() || !must_retry {
                return Ok(channel);
            }
            if start.elapsed() >= deadline {
                break;
            }
        }

        tracing::error!(
            peer = %addr,
            attempts,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "timeout in establishing a connection"
        );
        Err(NodeError::ConnectTimeout { addr, attempts })
    }

    /// Shorthand for `get_rdma_channel(addr, true)`.
    pub fn connect(&self, addr: SocketAddr) -> Result<ChannelRef> {
        self.get_rdma_channel(addr, true)
    }
}

