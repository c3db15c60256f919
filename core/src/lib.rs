// orgrelay core: identity, overlay node and admission control
//
// Everything the relay daemon needs below the HTTP layer:
// - identity:   durable peer identity stored in a single record file
// - transport:  the libp2p node (TCP, noise, yamux/mplex, Kademlia, identify, AutoNAT)
// - announce:   the one address we tell the world about
// - observer:   diagnostic taps on peer lifecycle events
// - admission:  bounded-concurrency gate for inbound requests

pub mod admission;
pub mod announce;
pub mod identity;
pub mod observer;
pub mod transport;

pub use admission::{
    AdmissionConfig, AdmissionError, AdmissionQueue, AdmissionStats, JobState, TimeoutPolicy,
};
pub use announce::{AddressAnnouncer, AddressSelection};
pub use identity::{resolve_identity, IdentityError, PeerIdentity, ResolvedIdentity};
pub use observer::{observe, LoggingObserver, PeerEventObserver};
pub use transport::{
    start_node, BootstrapDialFailure, BootstrapReport, NatStatus, NodeAddresses, OverlayError,
    OverlayEvent, OverlayNodeHandle, OverlayOptions,
};

/// Default location of the identity record, relative to the working directory.
pub const DEFAULT_IDENTITY_PATH: &str = "peerId_1.proto";

/// Default HTTP port; the overlay listens one above it.
pub const DEFAULT_HTTP_PORT: u16 = 4817;
