//! Tracker service (server side)
//!
//! One task per inbound tracker stream. Each connection walks
//! `AwaitingHandshake -> Active`: exactly one handshake message is decoded
//! first (anything else is a protocol error and closes the stream), then
//! requests are dispatched one at a time with exactly one reply each. A
//! closed or malformed stream marks that peer offline and affects no other
//! connection.

use super::messages::{self, Message};
use super::registry::Registry;
use super::TrackerError;
use crate::p2p::node::NodeHandle;
use crate::p2p::wire;
use crate::p2p::TRACKER_PROTOCOL;

use futures::{AsyncReadExt, StreamExt};
use libp2p::PeerId;
use libp2p_stream::IncomingStreams;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct TrackerService;

impl TrackerService {
    /// Register the tracker protocol and start accepting sessions. All
    /// previously online peers are marked offline before the first
    /// handshake is accepted.
    pub fn start(node: &NodeHandle, registry: Arc<Registry>) -> Result<JoinHandle<()>, TrackerError> {
        registry.mark_all_offline();
        tracing::info!("cleared stale online peer statuses");

        let incoming = node.accept(TRACKER_PROTOCOL)?;
        Ok(tokio::spawn(Self::run(incoming, registry)))
    }

    async fn run(mut incoming: IncomingStreams, registry: Arc<Registry>) {
        while let Some((peer, stream)) = incoming.next().await {
            tracing::info!(%peer, "new tracker connection");
            let registry = registry.clone();
            tokio::spawn(async move {
                let peer_key = peer.to_string();
                if let Err(e) = handle_session(peer, stream, &registry).await {
                    tracing::warn!(peer = %peer_key, error = %e, "tracker session ended with error");
                }
                registry.set_offline(&peer_key);
                tracing::info!(peer = %peer_key, "peer disconnected from tracker");
            });
        }
        tracing::debug!("tracker service stopped");
    }
}

async fn handle_session(
    peer: PeerId,
    stream: libp2p::Stream,
    registry: &Registry,
) -> Result<(), TrackerError> {
    let (mut reader, mut writer) = stream.split();
    let peer_key = peer.to_string();

    // AwaitingHandshake
    let Some(first) = wire::read_json_opt::<_, Message>(&mut reader).await? else {
        return Ok(());
    };
    if first.command != messages::HANDSHAKE {
        wire::write_json(&mut writer, &Message::error("expected HANDSHAKE command")).await?;
        return Ok(());
    }
    let handshake: messages::HandshakePayload = match first.payload_as() {
        Ok(payload) => payload,
        Err(_) => {
            wire::write_json(&mut writer, &Message::error("invalid handshake payload")).await?;
            return Ok(());
        }
    };
    if handshake.name.is_empty() {
        wire::write_json(&mut writer, &Message::error("invalid handshake payload")).await?;
        return Ok(());
    }

    registry.upsert_peer(&peer_key, &handshake.name, handshake.listen_addrs);
    tracing::info!(peer = %peer_key, name = %handshake.name, "peer registered");

    let snapshot = registry.online_peers();
    wire::write_json(&mut writer, &encode(messages::WELCOME, &snapshot)).await?;

    // Active: one reply per request
    loop {
        let Some(request) = wire::read_json_opt::<_, Message>(&mut reader).await? else {
            return Ok(());
        };
        tracing::debug!(peer = %peer_key, command = %request.command, "tracker request");

        let reply = dispatch(registry, &peer_key, &request);
        wire::write_json(&mut writer, &reply).await?;
    }
}

/// Map one request to exactly one reply.
pub(crate) fn dispatch(registry: &Registry, peer_key: &str, request: &Message) -> Message {
    match request.command.as_str() {
        messages::ANNOUNCE_FILE => match request.payload_as::<messages::AnnounceFilePayload>() {
            Err(e) => Message::error(format!("malformed announce payload: {e}")),
            Ok(payload) => {
                match registry.announce(peer_key, payload.fingerprint, &payload.filename, payload.size)
                {
                    Ok(file_id) => encode(
                        messages::ACK,
                        &messages::AnnounceAckPayload { file_id },
                    ),
                    Err(e) => Message::error(format!("registry error: {e}")),
                }
            }
        },

        messages::LIST_FILES => encode(messages::FILE_LIST, &registry.files()),

        messages::GET_PEERS_FOR_FILE => {
            match request.payload_as::<messages::PeersForFilePayload>() {
                Err(e) => Message::error(format!("malformed query payload: {e}")),
                Ok(payload) => encode(
                    messages::PEER_LIST,
                    &registry.online_providers(&payload.fingerprint),
                ),
            }
        }

        messages::GET_PEER_INFO => match request.payload_as::<messages::PeerInfoPayload>() {
            Err(e) => Message::error(format!("malformed query payload: {e}")),
            Ok(payload) => match registry.peer_info(&payload.peer_id) {
                Some(peer) => encode(messages::PEER_INFO, &peer),
                None => Message::error(format!("unknown peer {}", payload.peer_id)),
            },
        },

        messages::LIST_PEERS => encode(messages::PEER_LIST_ALL, &registry.online_peers()),

        messages::HANDSHAKE => Message::error("handshake already completed"),

        _ => Message::error("unknown command"),
    }
}

fn encode<T: serde::Serialize>(command: &str, payload: &T) -> Message {
    Message::with_payload(command, payload)
        .unwrap_or_else(|e| Message::error(format!("reply encoding failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Fingerprint;
    use crate::tracker::registry::ProviderEntry;

    fn registered(registry: &Registry, peer: &str) {
        registry.upsert_peer(peer, "tester", vec!["/ip4/127.0.0.1/tcp/9999".into()]);
    }

    fn announce_request(data: &[u8]) -> Message {
        Message::with_payload(
            messages::ANNOUNCE_FILE,
            &messages::AnnounceFilePayload {
                fingerprint: Fingerprint::hash(data),
                filename: "file.bin".into(),
                size: data.len() as u64,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_announce_acks_with_stable_file_id() {
        let registry = Registry::new();
        registered(&registry, "peer-1");
        let request = announce_request(b"content");

        let first = dispatch(&registry, "peer-1", &request);
        assert_eq!(first.command, messages::ACK);
        let first_ack: messages::AnnounceAckPayload = first.payload_as().unwrap();

        let second = dispatch(&registry, "peer-1", &request);
        let second_ack: messages::AnnounceAckPayload = second.payload_as().unwrap();
        assert_eq!(first_ack.file_id, second_ack.file_id);
    }

    #[test]
    fn test_announce_from_unregistered_peer_errors() {
        let registry = Registry::new();
        let reply = dispatch(&registry, "ghost", &announce_request(b"content"));
        assert_eq!(reply.command, messages::ERROR);
    }

    #[test]
    fn test_peers_for_unknown_file_is_empty_list() {
        let registry = Registry::new();
        registered(&registry, "peer-1");

        let request = Message::with_payload(
            messages::GET_PEERS_FOR_FILE,
            &messages::PeersForFilePayload {
                fingerprint: Fingerprint::hash(b"nobody has this"),
            },
        )
        .unwrap();

        let reply = dispatch(&registry, "peer-1", &request);
        assert_eq!(reply.command, messages::PEER_LIST);
        let providers: Vec<ProviderEntry> = reply.payload_as().unwrap();
        assert!(providers.is_empty());
    }

    #[test]
    fn test_peers_for_file_lists_online_providers() {
        let registry = Registry::new();
        registered(&registry, "peer-1");
        dispatch(&registry, "peer-1", &announce_request(b"content"));

        let request = Message::with_payload(
            messages::GET_PEERS_FOR_FILE,
            &messages::PeersForFilePayload {
                fingerprint: Fingerprint::hash(b"content"),
            },
        )
        .unwrap();

        let providers: Vec<ProviderEntry> =
            dispatch(&registry, "peer-1", &request).payload_as().unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, "peer-1");
    }

    #[test]
    fn test_list_files_and_peers() {
        let registry = Registry::new();
        registered(&registry, "peer-1");
        dispatch(&registry, "peer-1", &announce_request(b"content"));

        let files = dispatch(&registry, "peer-1", &Message::new(messages::LIST_FILES));
        assert_eq!(files.command, messages::FILE_LIST);

        let peers = dispatch(&registry, "peer-1", &Message::new(messages::LIST_PEERS));
        assert_eq!(peers.command, messages::PEER_LIST_ALL);
    }

    #[test]
    fn test_unknown_peer_info_errors() {
        let registry = Registry::new();
        let request = Message::with_payload(
            messages::GET_PEER_INFO,
            &messages::PeerInfoPayload {
                peer_id: "missing".into(),
            },
        )
        .unwrap();

        let reply = dispatch(&registry, "anyone", &request);
        assert_eq!(reply.command, messages::ERROR);
    }

    #[test]
    fn test_unknown_command_errors() {
        let registry = Registry::new();
        let reply = dispatch(&registry, "peer-1", &Message::new("MAKE_COFFEE"));
        assert_eq!(reply.command, messages::ERROR);
    }

    #[test]
    fn test_repeated_handshake_rejected() {
        let registry = Registry::new();
        let reply = dispatch(&registry, "peer-1", &Message::new(messages::HANDSHAKE));
        assert_eq!(reply.command, messages::ERROR);
    }
}
