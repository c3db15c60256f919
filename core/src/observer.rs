//! Diagnostic taps on overlay lifecycle events.
//!
//! The node task publishes [`OverlayEvent`]s on a channel; [`observe`] turns
//! the peer-connected and peer-discovered ones into calls on a
//! [`PeerEventObserver`]. Observers only watch. Nothing in the node depends
//! on what they do.

use crate::transport::OverlayEvent;
use libp2p::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg_attr(test, mockall::automock)]
pub trait PeerEventObserver: Send + Sync {
    /// First connection to `peer` was established.
    fn on_peer_connected(&self, peer: &PeerId);
    /// `peer` was discovered through bootstrap or the DHT.
    fn on_peer_discovered(&self, peer: &PeerId);
}

/// Writes one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl PeerEventObserver for LoggingObserver {
    fn on_peer_connected(&self, peer: &PeerId) {
        tracing::info!(peer_id = %peer, "Connection established");
    }

    fn on_peer_discovered(&self, peer: &PeerId) {
        tracing::info!(peer_id = %peer, "Discovered peer");
    }
}

/// Feed one event to the observer. Returns whether the observer was called.
pub fn dispatch(observer: &dyn PeerEventObserver, event: &OverlayEvent) -> bool {
    match event {
        OverlayEvent::PeerConnected(peer) => observer.on_peer_connected(peer),
        OverlayEvent::PeerDiscovered(peer) => observer.on_peer_discovered(peer),
        OverlayEvent::BootstrapDialFailed(_)
        | OverlayEvent::ListeningOn(_)
        | OverlayEvent::PeerDisconnected(_)
        | OverlayEvent::NatStatusChanged(_) => return false,
    }
    true
}

/// Drive `observer` from the node's event channel until the node goes away.
pub fn observe(
    mut events: mpsc::Receiver<OverlayEvent>,
    observer: Arc<dyn PeerEventObserver>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            dispatch(observer.as_ref(), &event);
        }
        tracing::debug!("Overlay event stream closed");
    })
}
