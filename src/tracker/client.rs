//! Tracker client session
//!
//! One persistent stream to the tracker. The session opens with a
//! handshake and keeps the stream for serialized request/reply round-trips;
//! a periodic keepalive doubles as the connectivity maintenance task.

use super::messages::{self, Message};
use super::registry::{FileRecord, PeerRecord, ProviderEntry};
use super::TrackerError;
use crate::crypto::Fingerprint;
use crate::p2p::node::{extract_peer_id, NodeHandle};
use crate::p2p::wire;
use crate::p2p::{P2PError, TRACKER_PROTOCOL};

use futures::io::{ReadHalf, WriteHalf};
use futures::AsyncReadExt;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

struct SessionIo {
    reader: ReadHalf<libp2p::Stream>,
    writer: WriteHalf<libp2p::Stream>,
}

/// Persistent tracker session.
pub struct TrackerSession {
    remote: PeerId,
    io: Mutex<SessionIo>,
    welcome: Vec<PeerRecord>,
}

impl TrackerSession {
    /// Dial the tracker, open the session stream and perform the
    /// handshake. The tracker address must carry a `/p2p` peer id.
    pub async fn connect(
        node: &NodeHandle,
        tracker_addr: Multiaddr,
        name: &str,
        handshake_timeout: Duration,
    ) -> Result<Arc<Self>, TrackerError> {
        let remote = extract_peer_id(&tracker_addr).ok_or_else(|| {
            TrackerError::Network(P2PError::Dial(
                "tracker address must include a /p2p peer id".into(),
            ))
        })?;

        node.dial(remote, vec![tracker_addr], handshake_timeout)
            .await?;
        let stream = node.open_stream(remote, TRACKER_PROTOCOL).await?;
        let (mut reader, mut writer) = stream.split();

        let listen_addrs: Vec<String> = node
            .listen_addrs()
            .await?
            .iter()
            .map(|a| a.to_string())
            .collect();

        let handshake = Message::with_payload(
            messages::HANDSHAKE,
            &messages::HandshakePayload {
                name: name.to_string(),
                listen_addrs,
            },
        )?;

        match timeout(handshake_timeout, wire::write_json(&mut writer, &handshake)).await {
            Err(_) => return Err(TrackerError::Network(P2PError::Timeout(handshake_timeout))),
            Ok(result) => result?,
        }

        let welcome: Message =
            match timeout(handshake_timeout, wire::read_json(&mut reader)).await {
                Err(_) => return Err(TrackerError::Network(P2PError::Timeout(handshake_timeout))),
                Ok(result) => result?,
            };

        match welcome.command.as_str() {
            messages::WELCOME => {}
            messages::ERROR => return Err(TrackerError::Remote(welcome.error_text())),
            other => {
                return Err(TrackerError::UnexpectedReply {
                    expected: messages::WELCOME.to_string(),
                    got: other.to_string(),
                })
            }
        }
        let snapshot: Vec<PeerRecord> = welcome.payload_as().unwrap_or_default();

        tracing::info!(tracker = %remote, online_peers = snapshot.len(), name, "tracker handshake complete");

        Ok(Arc::new(Self {
            remote,
            io: Mutex::new(SessionIo { reader, writer }),
            welcome: snapshot,
        }))
    }

    /// The tracker's peer identity.
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Online-peer snapshot received at handshake time.
    pub fn welcome_snapshot(&self) -> &[PeerRecord] {
        &self.welcome
    }

    /// One request, exactly one reply. The session lock serializes
    /// concurrent callers.
    async fn round_trip(&self, request: Message) -> Result<Message, TrackerError> {
        let mut io = self.io.lock().await;
        wire::write_json(&mut io.writer, &request).await?;
        match wire::read_json_opt::<_, Message>(&mut io.reader).await? {
            Some(reply) => Ok(reply),
            None => Err(TrackerError::Closed),
        }
    }

    fn expect(reply: Message, expected: &str) -> Result<Message, TrackerError> {
        if reply.command == expected {
            Ok(reply)
        } else if reply.command == messages::ERROR {
            Err(TrackerError::Remote(reply.error_text()))
        } else {
            Err(TrackerError::UnexpectedReply {
                expected: expected.to_string(),
                got: reply.command,
            })
        }
    }

    /// Announce a shared file; returns the tracker's file id.
    pub async fn announce_file(
        &self,
        fingerprint: Fingerprint,
        filename: &str,
        size: u64,
    ) -> Result<Uuid, TrackerError> {
        let request = Message::with_payload(
            messages::ANNOUNCE_FILE,
            &messages::AnnounceFilePayload {
                fingerprint,
                filename: filename.to_string(),
                size,
            },
        )?;
        let reply = Self::expect(self.round_trip(request).await?, messages::ACK)?;
        let ack: messages::AnnounceAckPayload = reply.payload_as()?;
        Ok(ack.file_id)
    }

    /// All files the tracker knows about.
    pub async fn list_files(&self) -> Result<Vec<FileRecord>, TrackerError> {
        let reply = Self::expect(
            self.round_trip(Message::new(messages::LIST_FILES)).await?,
            messages::FILE_LIST,
        )?;
        Ok(reply.payload_as()?)
    }

    /// Online providers of a file, in the tracker's trust-ranked order.
    pub async fn providers_for(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<ProviderEntry>, TrackerError> {
        let request = Message::with_payload(
            messages::GET_PEERS_FOR_FILE,
            &messages::PeersForFilePayload {
                fingerprint: *fingerprint,
            },
        )?;
        let reply = Self::expect(self.round_trip(request).await?, messages::PEER_LIST)?;
        Ok(reply.payload_as()?)
    }

    /// Full record for one peer, including its declared addresses.
    pub async fn peer_info(&self, peer_id: &str) -> Result<PeerRecord, TrackerError> {
        let request = Message::with_payload(
            messages::GET_PEER_INFO,
            &messages::PeerInfoPayload {
                peer_id: peer_id.to_string(),
            },
        )?;
        let reply = Self::expect(self.round_trip(request).await?, messages::PEER_INFO)?;
        Ok(reply.payload_as()?)
    }

    /// All currently online peers.
    pub async fn list_peers(&self) -> Result<Vec<PeerRecord>, TrackerError> {
        let reply = Self::expect(
            self.round_trip(Message::new(messages::LIST_PEERS)).await?,
            messages::PEER_LIST_ALL,
        )?;
        Ok(reply.payload_as()?)
    }

    /// Periodic liveness round-trip on the session. Stops on shutdown, when
    /// the session is dropped, or once the tracker stops answering.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(session) = session.upgrade() else { break };
                        if let Err(e) = session.list_peers().await {
                            tracing::warn!(error = %e, "tracker keepalive failed");
                            break;
                        }
                        tracing::trace!("tracker keepalive ok");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("tracker keepalive stopped");
        })
    }
}
