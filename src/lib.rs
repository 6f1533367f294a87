//! Peerlink Core - peer coordination and channel establishment
//!
//! Peers advertise content, discover each other through a Kademlia DHT or a
//! lightweight tracker, negotiate a direct data channel over a signaling
//! stream, and move file bytes with a chunked transfer protocol on top of
//! the established channel.

pub mod crypto;
pub mod identity;
pub mod p2p;
pub mod storage;
pub mod tracker;
pub mod transfer;
pub mod trust;

pub use crypto::Fingerprint;
pub use identity::NodeIdentity;
pub use p2p::{NodeConfig, RetryPolicy};
pub use storage::SharedFile;
pub use transfer::TransferReport;

use crate::p2p::channel::{self, DataChannel};
use crate::p2p::discovery::{
    self, Candidate, DhtDiscovery, ProviderDiscovery, TrackerDiscovery,
};
use crate::p2p::node::{self, extract_peer_id, Node, NodeHandle};
use crate::p2p::signaling::{self, ChannelSink, ResponderContext, SignalingTimeouts};
use crate::p2p::{ChannelOrchestrator, PeerDirectory, DATA_PROTOCOL, SIGNALING_PROTOCOL};
use crate::storage::{MemoryCatalog, SharedCatalog};
use crate::tracker::TrackerSession;
use crate::transfer::{format_bytes, TransferEngine};
use crate::trust::TrustLedger;

use chrono::Utc;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Main error type for peerlink operations
#[derive(Error, Debug)]
pub enum PeerlinkError {
    #[error("network error: {0}")]
    P2P(#[from] p2p::P2PError),

    #[error("discovery error: {0}")]
    Discovery(#[from] p2p::DiscoveryError),

    #[error("connection error: {0}")]
    Connect(#[from] p2p::ConnectError),

    #[error("transfer error: {0}")]
    Transfer(#[from] transfer::TransferError),

    #[error("tracker error: {0}")]
    Tracker(#[from] tracker::TrackerError),

    #[error("catalog error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("no providers found for {0}")]
    NoProviders(Fingerprint),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PeerlinkError>;

/// Node-level configuration
#[derive(Debug, Clone)]
pub struct PeerlinkConfig {
    /// Swarm configuration
    pub node: NodeConfig,

    /// Display name sent in tracker handshakes
    pub peer_name: String,

    /// Where downloaded files land
    pub download_dir: PathBuf,

    /// Transfer chunk size in bytes
    pub chunk_size: usize,

    /// Per-frame inactivity bound during a transfer
    pub transfer_idle_timeout: Duration,

    /// Connection establishment timeouts and retry schedule
    pub policy: RetryPolicy,

    /// Bound for a provider discovery pass
    pub discovery_timeout: Duration,

    /// Candidate providers collected per discovery pass
    pub max_providers: usize,

    /// Bound for a DHT content announce
    pub announce_timeout: Duration,

    /// Bound for the tracker dial plus handshake
    pub tracker_timeout: Duration,

    /// Period of the tracker keepalive round-trip
    pub keepalive_interval: Duration,
}

impl Default for PeerlinkConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            peer_name: "anonymous".to_string(),
            download_dir: PathBuf::from("./downloads"),
            chunk_size: 64 * 1024,
            transfer_idle_timeout: Duration::from_secs(60),
            policy: RetryPolicy::default(),
            discovery_timeout: Duration::from_secs(60),
            max_providers: 10,
            announce_timeout: Duration::from_secs(60),
            tracker_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

/// A running file-sharing node: swarm, peer directory, shared-file catalog,
/// trust ledger and transfer engine, wired together.
pub struct PeerlinkNode {
    node: NodeHandle,
    config: PeerlinkConfig,
    directory: Arc<PeerDirectory>,
    catalog: Arc<dyn SharedCatalog>,
    trust: TrustLedger,
    engine: Arc<TransferEngine>,
    orchestrator: Arc<ChannelOrchestrator>,
    tracker: RwLock<Option<Arc<TrackerSession>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PeerlinkNode {
    /// Start a node with in-memory catalog and trust stores.
    pub async fn start(identity: &NodeIdentity, config: PeerlinkConfig) -> Result<Self> {
        Self::start_with(
            identity,
            config,
            Arc::new(MemoryCatalog::new()),
            TrustLedger::in_memory(),
        )
        .await
    }

    /// Start a node with caller-provided catalog and trust stores.
    pub async fn start_with(
        identity: &NodeIdentity,
        config: PeerlinkConfig,
        catalog: Arc<dyn SharedCatalog>,
        trust: TrustLedger,
    ) -> Result<Self> {
        let (node, node_task) = Node::spawn(identity.keypair().clone(), config.node.clone()).await?;

        let directory = Arc::new(PeerDirectory::new());
        let engine = Arc::new(TransferEngine::new(
            catalog.clone(),
            config.download_dir.clone(),
            config.chunk_size,
            config.transfer_idle_timeout,
        ));
        let orchestrator = Arc::new(ChannelOrchestrator::new(node.clone(), config.policy.clone()));
        let pending = channel::new_pending();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let data_router = channel::spawn_data_router(node.accept(DATA_PROTOCOL)?, pending.clone());

        let on_ready: ChannelSink = {
            let directory = directory.clone();
            let engine = engine.clone();
            Arc::new(move |data_channel: DataChannel| {
                let peer = data_channel.peer();
                if let Some(replaced) = directory.insert(data_channel.handle()) {
                    tokio::spawn(async move { replaced.close().await });
                }

                let engine = engine.clone();
                let directory = directory.clone();
                tokio::spawn(async move {
                    let mut data_channel = data_channel;
                    engine.serve(&mut data_channel, peer).await;
                    data_channel.close().await;
                    directory.remove(&peer);
                });
            })
        };

        let responder = signaling::spawn_responder(
            node.accept(SIGNALING_PROTOCOL)?,
            ResponderContext {
                local: node.local_peer_id(),
                timeouts: SignalingTimeouts {
                    offer_write: config.policy.offer_write,
                    answer_wait: config.policy.answer_wait,
                    channel_open: config.policy.channel_open,
                },
                pending,
                on_ready,
            },
        );

        let maintenance = node::spawn_maintenance(
            node.clone(),
            config.node.maintenance_interval,
            config.node.min_peers,
            shutdown_rx,
        );

        Ok(Self {
            node,
            config,
            directory,
            catalog,
            trust,
            engine,
            orchestrator,
            tracker: RwLock::new(None),
            tasks: Mutex::new(vec![node_task, data_router, responder, maintenance]),
            shutdown_tx,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.node.local_peer_id()
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    pub fn trust(&self) -> &TrustLedger {
        &self.trust
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Files this node currently shares.
    pub fn shared_files(&self) -> Vec<SharedFile> {
        self.catalog.list()
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        Ok(self.node.listen_addrs().await?)
    }

    /// Manually connect to a peer. The address must carry a `/p2p` peer id.
    pub async fn connect_peer(&self, addr: Multiaddr) -> Result<PeerId> {
        let peer = extract_peer_id(&addr).ok_or_else(|| {
            PeerlinkError::P2P(p2p::P2PError::Dial(
                "address must include a /p2p peer id".into(),
            ))
        })?;
        self.node
            .dial(peer, vec![addr], self.config.policy.connect_timeout)
            .await?;
        Ok(peer)
    }

    /// Open a persistent tracker session and start its keepalive.
    pub async fn connect_tracker(&self, addr: Multiaddr) -> Result<()> {
        let session = TrackerSession::connect(
            &self.node,
            addr,
            &self.config.peer_name,
            self.config.tracker_timeout,
        )
        .await?;

        let keepalive =
            session.spawn_keepalive(self.config.keepalive_interval, self.shutdown_tx.subscribe());
        self.tasks.lock().push(keepalive);
        *self.tracker.write() = Some(session);
        Ok(())
    }

    /// Share a local file: fingerprint it, add it to the catalog, announce
    /// it on the DHT and to the tracker if a session exists. Announce
    /// failures are logged; the file stays shared locally.
    pub async fn share_file(&self, path: &Path) -> Result<SharedFile> {
        let (fingerprint, size) = crypto::fingerprint_file(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| fingerprint.to_hex());

        let shared = SharedFile {
            fingerprint,
            path: path.to_path_buf(),
            filename: filename.clone(),
            size,
            added_at: Utc::now(),
        };
        self.catalog.add(shared.clone())?;

        if let Err(e) = self
            .node
            .start_providing(fingerprint.as_bytes().to_vec(), self.config.announce_timeout)
            .await
        {
            tracing::warn!(%fingerprint, error = %e, "DHT announce failed");
        }

        let tracker = self.tracker.read().clone();
        if let Some(session) = tracker {
            match session.announce_file(fingerprint, &filename, size).await {
                Ok(file_id) => tracing::debug!(%fingerprint, %file_id, "announced to tracker"),
                Err(e) => tracing::warn!(%fingerprint, error = %e, "tracker announce failed"),
            }
        }

        tracing::info!(%fingerprint, name = %filename, size = %format_bytes(size), "sharing file");
        Ok(shared)
    }

    /// Resolve providers (tracker session if connected, DHT otherwise),
    /// rank them by trust, and try them sequentially until a transfer
    /// succeeds.
    pub async fn download(&self, fingerprint: &Fingerprint) -> Result<TransferReport> {
        let candidates = self.resolve_candidates(fingerprint).await?;
        if candidates.is_empty() {
            tracing::info!(%fingerprint, "no providers found");
            return Err(PeerlinkError::NoProviders(*fingerprint));
        }
        self.try_candidates(fingerprint, candidates).await
    }

    /// Download from a specific peer, skipping discovery.
    pub async fn download_from(
        &self,
        peer: PeerId,
        fingerprint: &Fingerprint,
    ) -> Result<TransferReport> {
        self.try_candidates(
            fingerprint,
            vec![Candidate {
                peer,
                addrs: vec![],
                trust: None,
                announced_at: None,
            }],
        )
        .await
    }

    async fn resolve_candidates(&self, fingerprint: &Fingerprint) -> Result<Vec<Candidate>> {
        let tracker = self.tracker.read().clone();
        let mut candidates = match tracker {
            Some(session) => {
                TrackerDiscovery::new(session, self.node.local_peer_id())
                    .resolve_providers(
                        fingerprint,
                        self.config.discovery_timeout,
                        self.config.max_providers,
                    )
                    .await?
            }
            None => {
                DhtDiscovery::new(self.node.clone())
                    .resolve_providers(
                        fingerprint,
                        self.config.discovery_timeout,
                        self.config.max_providers,
                    )
                    .await?
            }
        };

        discovery::rank_by_trust(&mut candidates, &self.trust);
        Ok(candidates)
    }

    /// Strictly sequential candidate attempts. Each attempt is independent:
    /// its failure feeds the trust ledger and leaves no state behind for
    /// the next candidate.
    async fn try_candidates(
        &self,
        fingerprint: &Fingerprint,
        candidates: Vec<Candidate>,
    ) -> Result<TransferReport> {
        let total = candidates.len();
        let mut last: Option<PeerlinkError> = None;

        for (index, candidate) in candidates.into_iter().enumerate() {
            let peer = candidate.peer;
            tracing::info!(%peer, provider = index + 1, of = total, %fingerprint, "trying provider");

            if !candidate.addrs.is_empty() {
                self.node.add_addresses(peer, candidate.addrs.clone()).await?;
            }

            // Connect before the capability check: the protocol list only
            // populates on a live connection.
            if let Err(e) = self
                .node
                .dial(peer, candidate.addrs.clone(), self.config.policy.connect_timeout)
                .await
            {
                tracing::warn!(%peer, error = %e, "could not connect to provider");
                last = Some(PeerlinkError::P2P(e));
                continue;
            }

            // Peers without the signaling capability are incompatible, not
            // an error.
            if !self.orchestrator.supports_signaling(peer).await {
                tracing::debug!(%peer, "provider lacks signaling support, skipping");
                continue;
            }

            let mut data_channel = match self.orchestrator.establish(peer).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "channel establishment failed");
                    self.trust.record_outcome(&peer.to_string(), false);
                    last = Some(e.into());
                    continue;
                }
            };

            self.directory.insert(data_channel.handle());
            let result = self.engine.download(&mut data_channel, fingerprint).await;
            data_channel.close().await;
            self.directory.remove(&peer);

            match result {
                Ok(report) => {
                    self.trust.record_outcome(&peer.to_string(), true);
                    return Ok(report);
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "transfer failed");
                    self.trust.record_outcome(&peer.to_string(), false);
                    last = Some(e.into());
                }
            }
        }

        Err(last.unwrap_or(PeerlinkError::NoProviders(*fingerprint)))
    }

    /// Stop background tasks, close all channels and shut the swarm down.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.directory.close_all().await;
        self.node.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}
