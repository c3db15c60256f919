//! Bootstrap list handling: seeding discovery at startup.
//!
//! Every entry is tried independently. A bad or unreachable entry only
//! costs us that entry: the remaining ones, plus whatever the DHT finds
//! organically, are enough to join the overlay.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

/// One bootstrap entry that could not be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("bootstrap entry {entry} failed: {reason}")]
pub struct BootstrapDialFailure {
    pub entry: String,
    pub reason: String,
}

/// A bootstrap entry that parsed cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapEntry {
    pub addr: Multiaddr,
    /// Taken from a trailing `/p2p/<id>` component when present.
    pub peer_id: Option<PeerId>,
}

impl BootstrapEntry {
    pub fn parse(raw: &str) -> Result<Self, BootstrapDialFailure> {
        let addr: Multiaddr = raw.trim().parse().map_err(|e| BootstrapDialFailure {
            entry: raw.to_string(),
            reason: format!("not a multiaddr: {e}"),
        })?;

        let peer_id = match addr.iter().last() {
            Some(Protocol::P2p(peer_id)) => Some(peer_id),
            _ => None,
        };

        Ok(Self { addr, peer_id })
    }

    /// The address without its `/p2p` suffix, as stored in the routing table.
    pub fn transport_addr(&self) -> Multiaddr {
        let mut addr = self.addr.clone();
        if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
            addr.pop();
        }
        addr
    }
}

/// What happened to the bootstrap list during startup.
///
/// Only failures detected synchronously are recorded here; connection
/// attempts that fail later surface as `OverlayEvent::BootstrapDialFailed`.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub attempted: usize,
    pub dialed: Vec<Multiaddr>,
    pub failures: Vec<BootstrapDialFailure>,
}

impl BootstrapReport {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Parse the whole list, keeping order, splitting good entries from bad.
pub fn parse_bootstrap_list<S: AsRef<str>>(
    list: &[S],
) -> (Vec<BootstrapEntry>, Vec<BootstrapDialFailure>) {
    let mut entries = Vec::with_capacity(list.len());
    let mut failures = Vec::new();

    for raw in list {
        match BootstrapEntry::parse(raw.as_ref()) {
            Ok(entry) => entries.push(entry),
            Err(failure) => failures.push(failure),
        }
    }

    (entries, failures)
}
