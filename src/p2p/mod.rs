//! P2P networking: discovery, signaling and channel establishment
//!
//! Built on a libp2p swarm (TCP/QUIC + noise + yamux) with Kademlia for
//! content and peer discovery. Raw per-protocol streams carry the signaling
//! handshake, the tracker session and the negotiated data channel.

pub mod channel;
pub mod directory;
pub mod discovery;
pub mod node;
pub mod orchestrator;
pub mod signaling;
pub mod wire;

pub use channel::{ChannelHandle, DataChannel};
pub use directory::PeerDirectory;
pub use discovery::{Candidate, DhtDiscovery, DiscoveryError, ProviderDiscovery, TrackerDiscovery};
pub use node::{Node, NodeConfig, NodeHandle};
pub use orchestrator::{ChannelOrchestrator, ConnectError, RetryPolicy};
pub use signaling::{SignalingError, SignalingSession, SignalingState};

use libp2p::StreamProtocol;
use std::time::Duration;
use thiserror::Error;

/// Protocol version tag used for Kademlia and identify.
pub const PROTOCOL_VERSION: &str = "/peerlink/1.0.0";

/// Stream tag for the signaling handshake. Single-use: one offer/answer
/// exchange per stream, never file bytes.
pub const SIGNALING_PROTOCOL: StreamProtocol = StreamProtocol::new("/peerlink/signal/1.0.0");

/// Stream tag for the negotiated data channel carrying file bytes.
pub const DATA_PROTOCOL: StreamProtocol = StreamProtocol::new("/peerlink/data/1.0.0");

/// Stream tag for the persistent tracker session.
pub const TRACKER_PROTOCOL: StreamProtocol = StreamProtocol::new("/peerlink/tracker/1.0.0");

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("failed to initialize network: {0}")]
    InitializationFailed(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("not connected to {0}")]
    NotConnected(libp2p::PeerId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote does not support protocol {0}")]
    UnsupportedProtocol(String),

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("node is shutting down")]
    ShuttingDown,
}
