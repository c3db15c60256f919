// Transport module: the libp2p overlay node

pub mod addresses;
pub mod behaviour;
pub mod bootstrap;
pub mod nat;
pub mod swarm;

pub use addresses::NodeAddresses;
pub use behaviour::{OverlayOptions, KAD_PROTOCOL};
pub use bootstrap::{BootstrapDialFailure, BootstrapEntry, BootstrapReport};
pub use nat::NatStatus;
pub use swarm::{start_node, OverlayEvent, OverlayNodeHandle};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("cannot listen on {addr}: {reason}")]
    ListenBindFailure { addr: String, reason: String },
    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("behaviour setup failed: {0}")]
    Behaviour(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("overlay node is not running")]
    NotRunning,
}
