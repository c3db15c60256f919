// NAT reachability as reported by AutoNAT
//
// AutoNAT asks connected peers to dial our advertised addresses back. The
// verdict is folded into our own NatStatus so the HTTP layer never needs
// to know about libp2p types.

use libp2p::autonat;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "address", rename_all = "snake_case")]
pub enum NatStatus {
    /// Peers could dial us back at this address.
    Public(String),
    /// Dial-backs failed; we sit behind a NAT or firewall.
    Private,
    /// Not enough probes yet.
    Unknown,
}

impl std::fmt::Display for NatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public(addr) => write!(f, "public ({addr})"),
            Self::Private => write!(f, "private"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<&autonat::NatStatus> for NatStatus {
    fn from(status: &autonat::NatStatus) -> Self {
        match status {
            autonat::NatStatus::Public(addr) => Self::Public(addr.to_string()),
            autonat::NatStatus::Private => Self::Private,
            autonat::NatStatus::Unknown => Self::Unknown,
        }
    }
}

/// Tracks the latest AutoNAT verdict.
#[derive(Debug)]
pub struct NatMonitor {
    status: NatStatus,
}

impl NatMonitor {
    pub fn new() -> Self {
        Self {
            status: NatStatus::Unknown,
        }
    }

    /// Feed one AutoNAT event; returns the new status when it changed.
    pub fn on_autonat_event(&mut self, event: autonat::Event) -> Option<NatStatus> {
        match event {
            autonat::Event::StatusChanged { new, .. } => {
                let mapped = NatStatus::from(&new);
                if mapped == self.status {
                    return None;
                }
                tracing::info!(old = %self.status, new = %mapped, "NAT status changed");
                self.status = mapped.clone();
                Some(mapped)
            }
            autonat::Event::InboundProbe(probe) => {
                tracing::debug!(?probe, "autonat inbound probe");
                None
            }
            autonat::Event::OutboundProbe(probe) => {
                tracing::debug!(?probe, "autonat outbound probe");
                None
            }
        }
    }
}

impl Default for NatMonitor {
    fn default() -> Self {
        Self::new()
    }
}
