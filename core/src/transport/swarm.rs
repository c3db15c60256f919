// libp2p swarm setup: the actual running overlay node
//
// start_node composes:
// - TCP transport with DNS resolution
// - Noise encryption (the only security upgrade, so plaintext is refused)
// - yamux or mplex, negotiated per connection
// - the behaviours from behaviour.rs
//
// and then hands the swarm to a tokio task. Callers talk to that task
// through an OverlayNodeHandle and listen to it through OverlayEvents.

use super::addresses::{with_peer_id, NodeAddresses};
use super::behaviour::{OverlayOptions, RelayBehaviour, RelayBehaviourEvent};
use super::bootstrap::{parse_bootstrap_list, BootstrapDialFailure, BootstrapReport};
use super::nat::{NatMonitor, NatStatus};
use super::OverlayError;
use crate::identity::PeerIdentity;
use futures::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{autonat, identify, kad, noise, tcp, yamux, Multiaddr, PeerId, Swarm};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Commands that can be sent to the node task
#[derive(Debug)]
enum OverlayCommand {
    Dial {
        addr: Multiaddr,
        reply: mpsc::Sender<Result<(), String>>,
    },
    Shutdown,
}

/// Lifecycle events emitted by the node task
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// The node is now bound to this address
    ListeningOn(Multiaddr),
    /// First connection to a peer established
    PeerConnected(PeerId),
    /// Last connection to a peer closed
    PeerDisconnected(PeerId),
    /// A peer entered the DHT routing table for the first time
    PeerDiscovered(PeerId),
    /// A bootstrap entry could not be reached
    BootstrapDialFailed(BootstrapDialFailure),
    /// AutoNAT changed its verdict
    NatStatusChanged(NatStatus),
}

/// State shared between the node task and its handles.
#[derive(Debug)]
struct NodeState {
    listen_addrs: Vec<Multiaddr>,
    connected: HashSet<PeerId>,
    nat: NatStatus,
}

/// Handle to communicate with the running node task
#[derive(Clone)]
pub struct OverlayNodeHandle {
    peer_id: PeerId,
    announce: Option<Multiaddr>,
    state: Arc<RwLock<NodeState>>,
    command_tx: mpsc::Sender<OverlayCommand>,
}

impl OverlayNodeHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Addresses peers should use to reach us, each ending in `/p2p/<peer id>`.
    ///
    /// The announce address when one is configured, the bound listen
    /// addresses otherwise.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        match &self.announce {
            Some(announce) => vec![with_peer_id(announce.clone(), self.peer_id)],
            None => self
                .state
                .read()
                .listen_addrs
                .iter()
                .map(|addr| with_peer_id(addr.clone(), self.peer_id))
                .collect(),
        }
    }

    /// Addresses the node is actually bound to.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.state.read().listen_addrs.clone()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state.read().connected.iter().copied().collect()
    }

    pub fn nat_status(&self) -> NatStatus {
        self.state.read().nat.clone()
    }

    /// Dial a peer at a multiaddress
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), OverlayError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::Dial {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| OverlayError::NotRunning)?;

        reply_rx
            .recv()
            .await
            .ok_or(OverlayError::NotRunning)?
            .map_err(OverlayError::Transport)
    }

    /// Stop the node task. Connections are dropped with it.
    pub async fn shutdown(&self) -> Result<(), OverlayError> {
        self.command_tx
            .send(OverlayCommand::Shutdown)
            .await
            .map_err(|_| OverlayError::NotRunning)
    }
}

/// Build the overlay node, bind it, seed discovery from the bootstrap list
/// and spawn its event loop.
///
/// Fails only if the swarm cannot be built or the listen address cannot be
/// bound. Bootstrap problems are reported, not returned as errors.
pub async fn start_node<S: AsRef<str>>(
    identity: &PeerIdentity,
    addresses: NodeAddresses,
    bootstrap: &[S],
    options: OverlayOptions,
    event_tx: mpsc::Sender<OverlayEvent>,
) -> Result<(OverlayNodeHandle, BootstrapReport), OverlayError> {
    let behaviour_options = options.clone();
    let swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            (yamux::Config::default, libp2p_mplex::MplexConfig::default),
        )
        .map_err(|e| OverlayError::Transport(e.to_string()))?
        .with_dns()
        .map_err(|e| OverlayError::Transport(e.to_string()))?
        .with_behaviour(|key| {
            RelayBehaviour::new(key, &behaviour_options)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
        .map_err(|e| OverlayError::Behaviour(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(options.idle_connection_timeout))
        .build();

    let state = Arc::new(RwLock::new(NodeState {
        listen_addrs: Vec::new(),
        connected: HashSet::new(),
        nat: NatStatus::Unknown,
    }));

    let mut task = NodeTask {
        swarm,
        state: state.clone(),
        nat: NatMonitor::new(),
        bootstrap_dials: HashMap::new(),
        event_tx,
    };

    // Answer DHT queries as well as issuing them
    task.swarm
        .behaviour_mut()
        .kademlia
        .set_mode(Some(kad::Mode::Server));

    let listener_id = task
        .swarm
        .listen_on(addresses.listen.clone())
        .map_err(|e| OverlayError::ListenBindFailure {
            addr: addresses.listen.to_string(),
            reason: e.to_string(),
        })?;
    task.await_listening(listener_id, &addresses.listen, &options)
        .await?;

    if let Some(announce) = &addresses.announce {
        task.swarm.add_external_address(announce.clone());
    }

    let report = task.dial_bootstrap(bootstrap);

    let (command_tx, command_rx) = mpsc::channel::<OverlayCommand>(64);
    let handle = OverlayNodeHandle {
        peer_id: *task.swarm.local_peer_id(),
        announce: addresses.announce,
        state,
        command_tx,
    };

    tracing::info!(
        peer_id = %handle.peer_id(),
        addrs = ?handle.multiaddrs(),
        "Overlay node listening"
    );

    tokio::spawn(task.run(command_rx));

    Ok((handle, report))
}

struct NodeTask {
    swarm: Swarm<RelayBehaviour>,
    state: Arc<RwLock<NodeState>>,
    nat: NatMonitor,
    /// Outbound bootstrap dials still in flight, by connection.
    bootstrap_dials: HashMap<ConnectionId, String>,
    event_tx: mpsc::Sender<OverlayEvent>,
}

impl NodeTask {
    /// Drive the swarm until our listener reports an address, fails, or the
    /// startup window closes.
    async fn await_listening(
        &mut self,
        listener_id: libp2p::core::transport::ListenerId,
        listen: &Multiaddr,
        options: &OverlayOptions,
    ) -> Result<(), OverlayError> {
        let bind_failure = |reason: String| OverlayError::ListenBindFailure {
            addr: listen.to_string(),
            reason,
        };

        let deadline = tokio::time::sleep(options.listen_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    let outcome = match &event {
                        SwarmEvent::NewListenAddr { listener_id: id, .. } if *id == listener_id => {
                            Some(Ok(()))
                        }
                        SwarmEvent::ListenerClosed { listener_id: id, reason, .. } if *id == listener_id => {
                            Some(Err(format!("listener closed: {reason:?}")))
                        }
                        SwarmEvent::ListenerError { listener_id: id, error } if *id == listener_id => {
                            Some(Err(error.to_string()))
                        }
                        _ => None,
                    };
                    self.handle_event(event);
                    match outcome {
                        Some(Ok(())) => return Ok(()),
                        Some(Err(reason)) => return Err(bind_failure(reason)),
                        None => {}
                    }
                }
                _ = &mut deadline => {
                    return Err(bind_failure("timed out waiting for listener".to_string()));
                }
            }
        }
    }

    /// Dial every bootstrap entry, seeding the routing table with the ones
    /// that name their peer.
    fn dial_bootstrap<S: AsRef<str>>(&mut self, bootstrap: &[S]) -> BootstrapReport {
        let (entries, failures) = parse_bootstrap_list(bootstrap);
        let mut report = BootstrapReport {
            attempted: bootstrap.len(),
            dialed: Vec::new(),
            failures,
        };

        let mut seeded = false;
        for entry in entries {
            let opts = match entry.peer_id {
                Some(peer_id) => {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, entry.transport_addr());
                    seeded = true;
                    DialOpts::peer_id(peer_id)
                        .addresses(vec![entry.transport_addr()])
                        .build()
                }
                None => DialOpts::unknown_peer_id().address(entry.addr.clone()).build(),
            };

            let connection_id = opts.connection_id();
            match self.swarm.dial(opts) {
                Ok(()) => {
                    self.bootstrap_dials
                        .insert(connection_id, entry.addr.to_string());
                    report.dialed.push(entry.addr);
                }
                Err(e) => report.failures.push(BootstrapDialFailure {
                    entry: entry.addr.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        for failure in &report.failures {
            tracing::warn!(entry = %failure.entry, reason = %failure.reason, "Bootstrap entry unusable");
        }

        if seeded {
            if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                tracing::warn!("Kademlia bootstrap not started: {:?}", e);
            }
        } else {
            tracing::warn!("No bootstrap peers with known IDs; relying on inbound discovery");
        }

        report
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<OverlayCommand>) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),

                command = command_rx.recv() => match command {
                    Some(OverlayCommand::Dial { addr, reply }) => {
                        let result = self.swarm.dial(addr).map_err(|e| e.to_string());
                        let _ = reply.send(result).await;
                    }
                    Some(OverlayCommand::Shutdown) | None => {
                        tracing::info!("Overlay node shutting down");
                        break;
                    }
                },
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<RelayBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {}", address);
                self.state.write().listen_addrs.push(address.clone());
                self.emit(OverlayEvent::ListeningOn(address));
            }

            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.state.write().listen_addrs.retain(|a| a != &address);
            }

            SwarmEvent::ListenerClosed { reason, .. } => {
                tracing::warn!("Listener closed: {:?}", reason);
            }

            SwarmEvent::ListenerError { error, .. } => {
                tracing::warn!("Listener error: {}", error);
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                self.bootstrap_dials.remove(&connection_id);
                tracing::debug!("Connected to {} via {}", peer_id, endpoint.get_remote_address());
                if num_established.get() == 1 {
                    self.state.write().connected.insert(peer_id);
                    self.emit(OverlayEvent::PeerConnected(peer_id));
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    tracing::debug!("Disconnected from {}", peer_id);
                    self.state.write().connected.remove(&peer_id);
                    self.emit(OverlayEvent::PeerDisconnected(peer_id));
                }
            }

            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
                ..
            } => match self.bootstrap_dials.remove(&connection_id) {
                Some(entry) => {
                    let failure = BootstrapDialFailure {
                        entry,
                        reason: error.to_string(),
                    };
                    tracing::warn!(entry = %failure.entry, reason = %failure.reason, "Bootstrap dial failed");
                    self.emit(OverlayEvent::BootstrapDialFailed(failure));
                }
                None => tracing::debug!(?peer_id, "Outgoing connection failed: {}", error),
            },

            SwarmEvent::ExternalAddrConfirmed { address } => {
                tracing::info!("External address confirmed: {}", address);
            }

            SwarmEvent::Behaviour(RelayBehaviourEvent::Kademlia(event)) => {
                self.on_kademlia_event(event)
            }

            SwarmEvent::Behaviour(RelayBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                tracing::debug!(
                    "Identified peer {} ({}) with {} addresses",
                    peer_id,
                    info.agent_version,
                    info.listen_addrs.len()
                );
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(RelayBehaviourEvent::Autonat(event)) => {
                self.on_autonat_event(event)
            }

            _ => {}
        }
    }

    fn on_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer, is_new_peer, ..
            } => {
                if is_new_peer {
                    self.emit(OverlayEvent::PeerDiscovered(peer));
                }
            }
            kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::Bootstrap(result),
                ..
            } => match result {
                Ok(ok) => tracing::debug!(
                    "Kademlia bootstrap step: {} buckets remaining",
                    ok.num_remaining
                ),
                Err(e) => tracing::warn!("Kademlia bootstrap failed: {:?}", e),
            },
            other => tracing::trace!(?other, "kademlia event"),
        }
    }

    fn on_autonat_event(&mut self, event: autonat::Event) {
        if let Some(status) = self.nat.on_autonat_event(event) {
            self.state.write().nat = status.clone();
            self.emit(OverlayEvent::NatStatusChanged(status));
        }
    }

    /// Events are diagnostics; a slow consumer loses events rather than
    /// stalling the network.
    fn emit(&self, event: OverlayEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Overlay event dropped: {}", e);
        }
    }
}
