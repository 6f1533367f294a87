//! P2P node: libp2p swarm, command loop and caches
//!
//! The swarm runs on its own task. Components talk to it through a
//! [`NodeHandle`]: commands go over a channel, raw protocol streams are
//! opened and accepted through the stream behaviour's control handle.

use super::{P2PError, PROTOCOL_VERSION};

use libp2p::{
    autonat, dcutr, identify,
    identity::Keypair,
    kad::{self, store::MemoryStore, Mode, RecordKey},
    mdns, noise, relay,
    swarm::{
        behaviour::toggle::Toggle,
        dial_opts::{DialOpts, PeerCondition},
        DialError, NetworkBehaviour, SwarmEvent,
    },
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use libp2p_stream as stream;

use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen addresses
    pub listen_addresses: Vec<Multiaddr>,

    /// Bootstrap nodes for the initial network join
    pub bootstrap_nodes: Vec<Multiaddr>,

    /// Enable mDNS for local network discovery
    pub enable_mdns: bool,

    /// Idle connection timeout
    pub idle_timeout: Duration,

    /// Period of the routing-table maintenance task
    pub maintenance_interval: Duration,

    /// Connected-peer count below which maintenance logs a warning
    pub min_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/0".parse().expect("valid multiaddr"),
                "/ip4/0.0.0.0/udp/0/quic-v1".parse().expect("valid multiaddr"),
            ],
            bootstrap_nodes: vec![],
            enable_mdns: true,
            idle_timeout: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(600),
            min_peers: 5,
        }
    }
}

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct PeerlinkBehaviour {
    /// Kademlia DHT for peer/content discovery
    pub kademlia: kad::Behaviour<MemoryStore>,

    /// Identify protocol for peer addresses and capabilities
    pub identify: identify::Behaviour,

    /// mDNS for local network discovery
    pub mdns: Toggle<mdns::tokio::Behaviour>,

    /// Relay client for NAT traversal
    pub relay_client: relay::client::Behaviour,

    /// DCUtR for direct connection upgrade through relay
    pub dcutr: dcutr::Behaviour,

    /// AutoNAT for NAT detection
    pub autonat: autonat::Behaviour,

    /// Raw protocol streams (signaling, tracker, data channels)
    pub stream: stream::Behaviour,
}

pub(crate) enum NodeCommand {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), P2PError>>,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    CachedAddrs {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<()>,
    },
    LookupPeer {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    GetProviders {
        key: Vec<u8>,
        sink: mpsc::UnboundedSender<PeerId>,
    },
    StartProviding {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<(), P2PError>>,
    },
    RefreshRoutingTable {
        reply: oneshot::Sender<()>,
    },
    SupportedProtocols {
        peer: PeerId,
        reply: oneshot::Sender<Vec<String>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<usize>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Shutdown,
}

/// Handle used by every component that needs the network.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<NodeCommand>,
    control: stream::Control,
    local_peer_id: PeerId,
}

impl NodeHandle {
    /// Local peer identity.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn send(&self, cmd: NodeCommand) -> Result<(), P2PError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| P2PError::ShuttingDown)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, P2PError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| P2PError::ShuttingDown)
    }

    /// Dial a peer at the given addresses, waiting up to `timeout` for the
    /// connection to establish.
    pub async fn dial(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        timeout: Duration,
    ) -> Result<(), P2PError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Dial {
            peer,
            addrs,
            reply: tx,
        })
        .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(P2PError::ShuttingDown),
            Err(_) => Err(P2PError::Timeout(timeout)),
        }
    }

    /// Whether a live connection to the peer exists right now.
    pub async fn is_connected(&self, peer: PeerId) -> Result<bool, P2PError> {
        self.request(|reply| NodeCommand::IsConnected { peer, reply })
            .await
    }

    /// Addresses cached from identify, mDNS and previous lookups.
    pub async fn cached_addresses(&self, peer: PeerId) -> Result<Vec<Multiaddr>, P2PError> {
        self.request(|reply| NodeCommand::CachedAddrs { peer, reply })
            .await
    }

    /// Seed the address cache (and Kademlia) with externally learned
    /// addresses, e.g. from a tracker reply.
    pub async fn add_addresses(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Result<(), P2PError> {
        self.request(|reply| NodeCommand::AddAddresses { peer, addrs, reply })
            .await
    }

    /// Resolve a peer's addresses through the DHT, bounded by `timeout`.
    pub async fn lookup_peer(
        &self,
        peer: PeerId,
        timeout: Duration,
    ) -> Result<Vec<Multiaddr>, P2PError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::LookupPeer { peer, reply: tx }).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(addrs)) => Ok(addrs),
            Ok(Err(_)) => Err(P2PError::ShuttingDown),
            Err(_) => Err(P2PError::Timeout(timeout)),
        }
    }

    /// Start a provider search. Discovered providers arrive on the returned
    /// channel as the query progresses; dropping the receiver ends the
    /// query.
    pub async fn provider_stream(
        &self,
        key: Vec<u8>,
    ) -> Result<mpsc::UnboundedReceiver<PeerId>, P2PError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(NodeCommand::GetProviders { key, sink: tx }).await?;
        Ok(rx)
    }

    /// Announce this node as a provider for `key` on the DHT.
    pub async fn start_providing(&self, key: Vec<u8>, timeout: Duration) -> Result<(), P2PError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::StartProviding { key, reply: tx })
            .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(P2PError::ShuttingDown),
            Err(_) => Err(P2PError::Timeout(timeout)),
        }
    }

    /// Trigger a routing-table refresh (re-adds bootstrap nodes and kicks a
    /// Kademlia bootstrap). Returns once the refresh has been started.
    pub async fn refresh_routing_table(&self) -> Result<(), P2PError> {
        self.request(|reply| NodeCommand::RefreshRoutingTable { reply })
            .await
    }

    /// Protocols the peer advertised via identify, if seen.
    pub async fn supported_protocols(&self, peer: PeerId) -> Result<Vec<String>, P2PError> {
        self.request(|reply| NodeCommand::SupportedProtocols { peer, reply })
            .await
    }

    /// Number of currently connected peers.
    pub async fn connected_peers(&self) -> Result<usize, P2PError> {
        self.request(|reply| NodeCommand::ConnectedPeers { reply })
            .await
    }

    /// Current listen addresses.
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, P2PError> {
        self.request(|reply| NodeCommand::ListenAddrs { reply }).await
    }

    /// Open a raw stream to a peer for the given protocol. The peer must
    /// already be connected.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<libp2p::Stream, P2PError> {
        let mut control = self.control.clone();
        match control.open_stream(peer, protocol).await {
            Ok(stream) => Ok(stream),
            Err(stream::OpenStreamError::UnsupportedProtocol(p)) => {
                Err(P2PError::UnsupportedProtocol(p.to_string()))
            }
            Err(e) => Err(P2PError::Transport(e.to_string())),
        }
    }

    /// Accept inbound streams for a protocol. May be called once per
    /// protocol.
    pub fn accept(&self, protocol: StreamProtocol) -> Result<stream::IncomingStreams, P2PError> {
        let mut control = self.control.clone();
        control
            .accept(protocol)
            .map_err(|e| P2PError::InitializationFailed(e.to_string()))
    }

    /// Stop the node event loop. Open streams and connections are dropped.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown).await;
    }
}

/// The swarm task. Owns all libp2p state; everything else goes through
/// [`NodeHandle`].
pub struct Node {
    swarm: Swarm<PeerlinkBehaviour>,
    cmd_rx: mpsc::Receiver<NodeCommand>,
    bootstrap_nodes: Vec<Multiaddr>,
    addr_cache: HashMap<PeerId, Vec<Multiaddr>>,
    protocol_cache: HashMap<PeerId, Vec<String>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), P2PError>>>>,
    provider_queries: HashMap<kad::QueryId, mpsc::UnboundedSender<PeerId>>,
    lookup_queries: HashMap<kad::QueryId, (PeerId, oneshot::Sender<Vec<Multiaddr>>)>,
    provide_queries: HashMap<kad::QueryId, oneshot::Sender<Result<(), P2PError>>>,
}

impl Node {
    /// Build the swarm, start listening, seed the DHT with the configured
    /// bootstrap nodes and spawn the event loop.
    pub async fn spawn(
        keypair: Keypair,
        config: NodeConfig,
    ) -> Result<(NodeHandle, JoinHandle<()>), P2PError> {
        let mut swarm = build_swarm(keypair, &config).await?;
        let local_peer_id = *swarm.local_peer_id();

        tracing::info!(peer = %local_peer_id, "starting p2p node");

        for addr in &config.listen_addresses {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| P2PError::Transport(e.to_string()))?;
        }

        for addr in &config.bootstrap_nodes {
            if let Some(peer_id) = extract_peer_id(addr) {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
            }
            if let Err(e) = swarm.dial(addr.clone()) {
                tracing::debug!(%addr, error = %e, "bootstrap dial failed to start");
            }
        }
        if !config.bootstrap_nodes.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                tracing::debug!(error = %e, "initial DHT bootstrap not started");
            }
        }

        let control = swarm.behaviour().stream.new_control();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let node = Node {
            swarm,
            cmd_rx,
            bootstrap_nodes: config.bootstrap_nodes.clone(),
            addr_cache: HashMap::new(),
            protocol_cache: HashMap::new(),
            pending_dials: HashMap::new(),
            provider_queries: HashMap::new(),
            lookup_queries: HashMap::new(),
            provide_queries: HashMap::new(),
        };
        let task = tokio::spawn(node.run());

        Ok((
            NodeHandle {
                cmd_tx,
                control,
                local_peer_id,
            },
            task,
        ))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
        tracing::debug!("node event loop stopped");
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Dial { peer, addrs, reply } => self.start_dial(peer, addrs, reply),
            NodeCommand::IsConnected { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }
            NodeCommand::CachedAddrs { peer, reply } => {
                let _ = reply.send(self.addr_cache.get(&peer).cloned().unwrap_or_default());
            }
            NodeCommand::AddAddresses { peer, addrs, reply } => {
                for addr in addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer, addr.clone());
                    self.remember_address(peer, addr);
                }
                let _ = reply.send(());
            }
            NodeCommand::LookupPeer { peer, reply } => {
                let query = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.lookup_queries.insert(query, (peer, reply));
            }
            NodeCommand::GetProviders { key, sink } => {
                let query = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(RecordKey::new(&key));
                self.provider_queries.insert(query, sink);
            }
            NodeCommand::StartProviding { key, reply } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(RecordKey::new(&key))
                {
                    Ok(query) => {
                        self.provide_queries.insert(query, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(P2PError::Dht(e.to_string())));
                    }
                }
            }
            NodeCommand::RefreshRoutingTable { reply } => {
                let bootstrap_nodes = self.bootstrap_nodes.clone();
                for addr in &bootstrap_nodes {
                    if let Some(peer_id) = extract_peer_id(addr) {
                        if !self.swarm.is_connected(&peer_id) {
                            if let Err(e) = self.swarm.dial(addr.clone()) {
                                tracing::debug!(%addr, error = %e, "bootstrap redial failed to start");
                            }
                        }
                    }
                }
                if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                    tracing::debug!(error = %e, "routing table refresh not started");
                }
                let _ = reply.send(());
            }
            NodeCommand::SupportedProtocols { peer, reply } => {
                let _ = reply.send(self.protocol_cache.get(&peer).cloned().unwrap_or_default());
            }
            NodeCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().count());
            }
            NodeCommand::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            NodeCommand::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    fn start_dial(
        &mut self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), P2PError>>,
    ) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        for addr in &addrs {
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer, addr.clone());
        }

        let opts = DialOpts::peer_id(peer)
            .addresses(addrs)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();

        match self.swarm.dial(opts) {
            Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
            // An in-flight dial will resolve this waiter too.
            Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply)
            }
            Err(e) => {
                let _ = reply.send(Err(P2PError::Dial(e.to_string())));
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<PeerlinkBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("listening on {address}");
            }

            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                tracing::debug!(peer = %peer_id, "connected");
                self.remember_address(peer_id, endpoint.get_remote_address().clone());
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }

            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                tracing::debug!(peer = %peer_id, "disconnected");
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if let Some(waiters) = self.pending_dials.remove(&peer) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(P2PError::Dial(error.to_string())));
                    }
                }
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: PeerlinkBehaviourEvent) {
        match event {
            PeerlinkBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    tracing::debug!(peer = %peer_id, %addr, "mDNS discovered");
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.remember_address(peer_id, addr);
                }
            }

            PeerlinkBehaviourEvent::Identify(identify::Event::Received {
                peer_id, info, ..
            }) => {
                tracing::debug!(
                    peer = %peer_id,
                    agent = %info.agent_version,
                    "identified peer"
                );
                self.protocol_cache.insert(
                    peer_id,
                    info.protocols.iter().map(|p| p.to_string()).collect(),
                );
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.remember_address(peer_id, addr);
                }
            }

            PeerlinkBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            }) => {
                self.handle_query_result(id, result);
                if step.last {
                    self.provider_queries.remove(&id);
                }
            }

            _ => {}
        }
    }

    fn handle_query_result(&mut self, id: kad::QueryId, result: kad::QueryResult) {
        match result {
            kad::QueryResult::GetClosestPeers(result) => {
                let Some((target, reply)) = self.lookup_queries.remove(&id) else {
                    return;
                };
                let found = match result {
                    Ok(kad::GetClosestPeersOk { peers, .. }) => peers,
                    // Partial results from a timed-out query are still usable.
                    Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                };
                let mut addrs = Vec::new();
                for info in found {
                    if info.peer_id == target {
                        for addr in &info.addrs {
                            self.swarm
                                .behaviour_mut()
                                .kademlia
                                .add_address(&target, addr.clone());
                            self.remember_address(target, addr.clone());
                        }
                        addrs = info.addrs;
                        break;
                    }
                }
                let _ = reply.send(addrs);
            }

            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                let mut receiver_gone = false;
                if let Some(sink) = self.provider_queries.get(&id) {
                    for provider in providers {
                        if sink.send(provider).is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                }
                // Receiver satisfied or dropped; stop the query.
                if receiver_gone {
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                    self.provider_queries.remove(&id);
                }
            }

            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                self.provider_queries.remove(&id);
            }

            kad::QueryResult::GetProviders(Err(e)) => {
                tracing::debug!(error = %e, "provider query ended");
                self.provider_queries.remove(&id);
            }

            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.provide_queries.remove(&id) {
                    let _ = reply.send(
                        result
                            .map(|_| ())
                            .map_err(|e| P2PError::Dht(e.to_string())),
                    );
                }
            }

            kad::QueryResult::Bootstrap(Ok(bootstrap)) => {
                if bootstrap.num_remaining == 0 {
                    tracing::debug!("DHT bootstrap pass finished");
                }
            }

            _ => {}
        }
    }

    fn remember_address(&mut self, peer: PeerId, addr: Multiaddr) {
        let addrs = self.addr_cache.entry(peer).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
}

async fn build_swarm(
    keypair: Keypair,
    config: &NodeConfig,
) -> Result<Swarm<PeerlinkBehaviour>, P2PError> {
    let peer_id = PeerId::from(keypair.public());
    let public = keypair.public();

    let kademlia = {
        let store = MemoryStore::new(peer_id);
        let mut cfg = kad::Config::new(StreamProtocol::new(PROTOCOL_VERSION));
        cfg.set_query_timeout(Duration::from_secs(60));
        let mut behaviour = kad::Behaviour::with_config(peer_id, store, cfg);
        behaviour.set_mode(Some(Mode::Server));
        behaviour
    };

    let identify = identify::Behaviour::new(
        identify::Config::new(PROTOCOL_VERSION.to_string(), public)
            .with_agent_version(format!("peerlink/{}", env!("CARGO_PKG_VERSION"))),
    );

    let mdns = if config.enable_mdns {
        let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
            .map_err(|e| P2PError::InitializationFailed(e.to_string()))?;
        Toggle::from(Some(behaviour))
    } else {
        Toggle::from(None)
    };

    let dcutr = dcutr::Behaviour::new(peer_id);
    let autonat = autonat::Behaviour::new(peer_id, autonat::Config::default());
    let streams = stream::Behaviour::new();

    let idle_timeout = config.idle_timeout;
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| P2PError::InitializationFailed(e.to_string()))?
        .with_quic()
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| P2PError::InitializationFailed(e.to_string()))?
        .with_behaviour(|_keypair, relay_client| PeerlinkBehaviour {
            kademlia,
            identify,
            mdns,
            relay_client,
            dcutr,
            autonat,
            stream: streams,
        })
        .map_err(|e| P2PError::InitializationFailed(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}

/// Extract the peer id component from a multiaddr, if present.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let libp2p::multiaddr::Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })
}

/// Periodic routing-table maintenance: refresh the table and log when the
/// peer count is low. Owned by the caller and stopped via the shutdown
/// signal.
pub fn spawn_maintenance(
    handle: NodeHandle,
    interval: Duration,
    min_peers: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; maintenance should not.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!("running routing-table maintenance");
                    if handle.refresh_routing_table().await.is_err() {
                        break;
                    }
                    match handle.connected_peers().await {
                        Ok(count) if count < min_peers => {
                            tracing::info!(connected = count, "low peer count after maintenance pass");
                        }
                        Ok(count) => {
                            tracing::debug!(connected = count, "maintenance pass complete");
                        }
                        Err(_) => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("maintenance task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NodeConfig {
        NodeConfig {
            listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            enable_mdns: false,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_extract_peer_id() {
        let keypair = Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer_id}")
            .parse()
            .unwrap();

        assert_eq!(extract_peer_id(&addr), Some(peer_id));
        assert_eq!(extract_peer_id(&"/ip4/127.0.0.1/tcp/4001".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let keypair = Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());

        let (handle, task) = Node::spawn(keypair, test_config()).await.unwrap();
        assert_eq!(handle.local_peer_id(), peer_id);

        let other = PeerId::from(Keypair::generate_ed25519().public());
        assert!(!handle.is_connected(other).await.unwrap());
        assert_eq!(handle.connected_peers().await.unwrap(), 0);
        assert!(handle.cached_addresses(other).await.unwrap().is_empty());

        handle.shutdown().await;
        task.await.unwrap();
    }
}
