//! Tracker: central peer/file registry as an alternative to DHT lookup
//!
//! The server side accepts persistent tracker sessions, maintains
//! online/offline state and answers file/peer/trust queries. The client
//! side keeps one session open and issues request/reply round-trips over
//! it.

pub mod client;
pub mod messages;
pub mod registry;
pub mod service;

pub use client::TrackerSession;
pub use messages::Message;
pub use registry::{FileRecord, PeerRecord, ProviderEntry, ProviderLink, Registry};
pub use service::TrackerService;

use crate::p2p::wire::WireError;
use crate::p2p::P2PError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Network(#[from] P2PError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("tracker replied with an error: {0}")]
    Remote(String),

    #[error("unexpected reply {got} (expected {expected})")]
    UnexpectedReply { expected: String, got: String },

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("tracker session closed")]
    Closed,
}
