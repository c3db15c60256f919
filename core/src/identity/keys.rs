// Peer key material

use libp2p::identity::{DecodingError, Keypair};
use libp2p::PeerId;
use zeroize::Zeroizing;

/// The node's long-lived keypair together with the peer ID derived from it.
#[derive(Clone)]
pub struct PeerIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl PeerIdentity {
    /// Generate a fresh ed25519 identity
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Serialize the keypair in libp2p's protobuf record format.
    /// The returned buffer wipes the secret key material on drop.
    pub fn to_record(&self) -> Result<Zeroizing<Vec<u8>>, DecodingError> {
        self.keypair.to_protobuf_encoding().map(Zeroizing::new)
    }

    /// Parse a record previously produced by [`PeerIdentity::to_record`].
    pub fn from_record(bytes: &[u8]) -> Result<Self, DecodingError> {
        let keypair = Keypair::from_protobuf_encoding(bytes)?;
        Ok(Self::from_keypair(keypair))
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the secret half
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
