//! The accept loop.
//!
//! Runs on the `rnode-accept` thread while the node's running flag is set,
//! polling the node's event channel with the teardown timeout. This thread is
//! the only writer of the passive registry apart from shutdown.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rnode_verbs::{CmEvent, CmEventType, CmId, EventChannel, Fabric};

use super::{AcceptLoopState, NodeShared};
use crate::channel::ChannelType;
use crate::shutdown::{panic_message, stop_channel};

pub(super) fn run<F: Fabric>(shared: Arc<NodeShared<F>>, events: Arc<F::EventChannel>) {
    let timeout = shared.config.teardown_listen_timeout();
    let local = *shared.local_addr.lock();
    tracing::info!(local = ?local, "starting accept loop");
    shared.set_accept_state(AcceptLoopState::Running);

    let mut exit_state = AcceptLoopState::Exited;
    while shared.running.load(Ordering::Acquire) {
        let event = match events.get_cm_event(timeout) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!("accept loop event channel failed, no more connections will be accepted: {}", e);
                exit_state = AcceptLoopState::Failed;
                break;
            }
        };

        let kind = event.event_type();
        let id = event.conn_id();
        event.ack();

        let Some(peer) = id.destination() else {
            tracing::warn!(event = %kind, "CM event without a peer address, ignoring");
            // A request's id belongs to no channel yet; other events carry ids
            // owned by a channel or by the listener.
            if kind == CmEventType::ConnectRequest {
                let _ = id.destroy();
            }
            continue;
        };

        let handled = catch_unwind(AssertUnwindSafe(|| handle_event(&shared, kind, id, peer)));
        if let Err(panic) = handled {
            tracing::error!(
                %peer,
                event = %kind,
                "accept loop handler panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }

    shared.set_accept_state(exit_state);
    tracing::info!(local = ?local, "exiting accept loop");
}

fn handle_event<F: Fabric>(shared: &NodeShared<F>, kind: CmEventType, id: F::CmId, peer: SocketAddr) {
    tracing::debug!(%peer, event = %kind, "CM event");
    match kind {
        CmEventType::ConnectRequest => on_connect_request(shared, id, peer),
        CmEventType::Established => on_established(shared, peer),
        CmEventType::Disconnected => on_disconnected(shared, peer),
        other => tracing::info!(%peer, event = %other, "unexpected CM event, ignoring"),
    }
}

fn on_connect_request<F: Fabric>(shared: &NodeShared<F>, id: F::CmId, peer: SocketAddr) {
    let passive = &shared.passive;

    if let Some(existing) = passive.get(&peer) {
        if existing.is_error() {
            tracing::warn!(
                %peer,
                "redundant connection request with an older connection in error state, replacing it"
            );
            passive.remove_if_same(&peer, &existing);
            stop_channel(&existing);
        } else {
            // No reject primitive; the duplicate request is left unanswered.
            tracing::warn!(%peer, "redundant connection request, dropping it");
            if let Err(e) = id.destroy() {
                tracing::debug!(%peer, "failed to destroy dropped request id: {}", e);
            }
            return;
        }
    }

    let channel = match shared.new_channel(ChannelType::ReadResponder, Some(id.clone()), Some(peer)) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(%peer, "cannot create passive channel: {}", e);
            let _ = id.destroy();
            return;
        }
    };

    if !passive.insert_if_absent(peer, Arc::clone(&channel)) {
        tracing::warn!(%peer, "race in creating a passive channel");
        stop_channel(&channel);
        return;
    }

    if let Err(e) = channel.accept() {
        tracing::error!(%peer, "error in accept on a passive channel: {}", e);
        passive.remove_if_same(&peer, &channel);
        stop_channel(&channel);
    }
}

fn on_established<F: Fabric>(shared: &NodeShared<F>, peer: SocketAddr) {
    let passive = &shared.passive;
    let Some(channel) = passive.get(&peer) else {
        tracing::warn!(%peer, "established event with no matching connection, ignoring");
        return;
    };

    if channel.is_error() {
        tracing::warn!(
            %peer,
            "established event for a connection in error state, removing it"
        );
        passive.remove_if_same(&peer, &channel);
        stop_channel(&channel);
    } else {
        channel.finalize_connection();
        passive.notify();
        tracing::info!(%peer, "passive connection established");
    }
}

fn on_disconnected<F: Fabric>(shared: &NodeShared<F>, peer: SocketAddr) {
    match shared.passive.remove(&peer) {
        Some(channel) => {
            tracing::info!(%peer, "peer disconnected");
            stop_channel(&channel);
        }
        None => {
            tracing::info!(%peer, "disconnect event with no matching connection, ignoring");
        }
    }
}
