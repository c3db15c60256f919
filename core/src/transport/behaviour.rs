// Combined NetworkBehaviour for the relay
//
// - kademlia: DHT participation in server mode, fed by bootstrap + identify
// - identify: exchange listen addresses and supported protocols
// - autonat:  ask peers to dial us back to learn whether we are reachable

use super::OverlayError;
use libp2p::{autonat, identify, kad, swarm::NetworkBehaviour, StreamProtocol};
use std::time::Duration;

/// Kademlia protocol shared by every node of the overlay.
pub const KAD_PROTOCOL: &str = "/org/kad/1.0.0";

/// Protocol version announced through identify.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/org/relay/1.0.0";

/// Tunables for the behaviour stack.
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub kad_protocol: String,
    pub kad_query_timeout: Duration,
    pub identify_interval: Duration,
    pub idle_connection_timeout: Duration,
    /// How long `start_node` waits for the listener to come up.
    pub listen_timeout: Duration,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            kad_protocol: KAD_PROTOCOL.to_string(),
            kad_query_timeout: Duration::from_secs(60),
            identify_interval: Duration::from_secs(5 * 60),
            idle_connection_timeout: Duration::from_secs(60),
            listen_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub autonat: autonat::Behaviour,
}

impl RelayBehaviour {
    pub fn new(
        keypair: &libp2p::identity::Keypair,
        options: &OverlayOptions,
    ) -> Result<Self, OverlayError> {
        let peer_id = keypair.public().to_peer_id();

        let protocol = StreamProtocol::try_from_owned(options.kad_protocol.clone())
            .map_err(|e| OverlayError::Behaviour(format!("invalid Kademlia protocol: {e}")))?;
        let mut kad_config = kad::Config::default();
        kad_config.set_protocol_names(vec![protocol]);
        kad_config.set_query_timeout(options.kad_query_timeout);
        let kademlia =
            kad::Behaviour::with_config(peer_id, kad::store::MemoryStore::new(peer_id), kad_config);

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_string(), keypair.public())
                .with_agent_version(format!("orgrelay/{}", env!("CARGO_PKG_VERSION")))
                .with_push_listen_addr_updates(true)
                .with_interval(options.identify_interval),
        );

        let autonat = autonat::Behaviour::new(peer_id, autonat::Config::default());

        Ok(Self {
            kademlia,
            identify,
            autonat,
        })
    }
}
