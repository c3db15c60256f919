// Identity: the relay's peer ID must survive restarts, because other
// nodes keep our address (and therefore our peer ID) in their bootstrap lists.

mod keys;
mod store;

pub use keys::PeerIdentity;
pub use store::resolve_identity;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    /// A record exists but does not decode to a keypair.
    #[error("identity record at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("identity record at {path} is not accessible: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode identity: {0}")]
    Encode(String),
}

/// Outcome of [`resolve_identity`], telling first run apart from steady state.
#[derive(Debug, Clone)]
pub enum ResolvedIdentity {
    /// Read back from an existing record.
    Loaded(PeerIdentity),
    /// Freshly generated and written to disk.
    Created(PeerIdentity),
}

impl ResolvedIdentity {
    pub fn identity(&self) -> &PeerIdentity {
        match self {
            Self::Loaded(identity) | Self::Created(identity) => identity,
        }
    }

    pub fn into_identity(self) -> PeerIdentity {
        match self {
            Self::Loaded(identity) | Self::Created(identity) => identity,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}
