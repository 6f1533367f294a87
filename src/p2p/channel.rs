//! Data channels
//!
//! A data channel is a dedicated stream negotiated via the signaling
//! handshake. The initiator opens it and tags it with the session id; the
//! responder matches the tag against its pending sessions and confirms with
//! `CHANNEL_READY`. All file bytes flow here, never on the signaling
//! stream.

use super::node::NodeHandle;
use super::signaling::{SignalingError, SignalingSession, SignalingState, SignalingTimeouts};
use super::wire::{self, Frame, WireError};
use super::DATA_PROTOCOL;
use crate::crypto::Fingerprint;

use async_trait::async_trait;
use futures::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use futures::StreamExt;
use libp2p::PeerId;
use libp2p_stream::IncomingStreams;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// Bound for the first (hello) frame on an inbound data stream.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Structured control messages exchanged as non-binary frames on a data
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ControlMessage {
    /// Ask the remote peer to stream the file with this fingerprint
    #[serde(rename = "REQUEST_FILE")]
    RequestFile { fingerprint: Fingerprint },

    /// Terminal marker after the last chunk of a transfer
    #[serde(rename = "TRANSFER_COMPLETE")]
    TransferComplete,

    /// Application-level failure reported to the remote peer
    #[serde(rename = "error")]
    Error { message: String },

    /// First frame on a fresh data stream, tagging it with its session
    #[serde(rename = "CHANNEL_OPEN")]
    ChannelOpen { session: Uuid },

    /// Responder's confirmation that the channel is open
    #[serde(rename = "CHANNEL_READY")]
    ChannelReady { session: Uuid },
}

/// Decode a control frame body.
pub fn decode_control(body: &[u8]) -> Result<ControlMessage, WireError> {
    Ok(serde_json::from_slice(body)?)
}

/// Outbound frames of a channel.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), WireError>;
    async fn send_chunk(&mut self, data: &[u8]) -> Result<(), WireError>;
}

/// Inbound frames of a channel, in arrival order.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the remote closed cleanly.
    async fn next_frame(&mut self) -> Result<Option<Frame>, WireError>;
}

/// An established peer-to-peer data channel.
pub struct DataChannel {
    peer: PeerId,
    session: Uuid,
    reader: ReadHalf<libp2p::Stream>,
    writer: Arc<AsyncMutex<WriteHalf<libp2p::Stream>>>,
}

impl DataChannel {
    pub fn new(peer: PeerId, session: Uuid, stream: libp2p::Stream) -> Self {
        let (reader, writer) = stream.split();
        Self {
            peer,
            session,
            reader,
            writer: Arc::new(AsyncMutex::new(writer)),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Shareable write-side handle, e.g. for the peer directory.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            peer: self.peer,
            session: self.session,
            writer: self.writer.clone(),
        }
    }

    /// Close the write side. The remote observes end of stream.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

#[async_trait]
impl FrameSink for DataChannel {
    async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        wire::write_control(&mut *writer, msg).await
    }

    async fn send_chunk(&mut self, data: &[u8]) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        wire::write_binary(&mut *writer, data).await
    }
}

#[async_trait]
impl FrameSource for DataChannel {
    async fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        wire::read_frame(&mut self.reader).await
    }
}

/// Write-side handle to a live channel, held by the peer directory.
#[derive(Clone)]
pub struct ChannelHandle {
    peer: PeerId,
    session: Uuid,
    writer: Arc<AsyncMutex<WriteHalf<libp2p::Stream>>>,
}

impl ChannelHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        wire::write_control(&mut *writer, msg).await
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

/// Sessions awaiting their data stream, keyed by session id.
pub type PendingChannels = Arc<Mutex<HashMap<Uuid, oneshot::Sender<(PeerId, libp2p::Stream)>>>>;

pub fn new_pending() -> PendingChannels {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Register a session and obtain the receiver its data stream will arrive
/// on.
pub fn register(
    pending: &PendingChannels,
    session: Uuid,
) -> oneshot::Receiver<(PeerId, libp2p::Stream)> {
    let (tx, rx) = oneshot::channel();
    pending.lock().insert(session, tx);
    rx
}

/// Drop a session that will no longer be matched.
pub fn unregister(pending: &PendingChannels, session: &Uuid) {
    pending.lock().remove(session);
}

/// Initiator side of channel negotiation: open the data stream, tag it with
/// the session, and wait for the responder's `CHANNEL_READY`.
pub async fn open_channel(
    node: &NodeHandle,
    session: &mut SignalingSession,
    timeouts: &SignalingTimeouts,
) -> Result<DataChannel, SignalingError> {
    session.advance(SignalingState::ChannelNegotiating)?;

    let stream = match timeout(
        timeouts.channel_open,
        node.open_stream(session.remote(), DATA_PROTOCOL),
    )
    .await
    {
        Err(_) => {
            session.fail();
            return Err(SignalingError::ChannelOpenTimeout(timeouts.channel_open));
        }
        Ok(Err(e)) => {
            session.fail();
            return Err(SignalingError::StreamOpen(e.to_string()));
        }
        Ok(Ok(stream)) => stream,
    };

    let mut channel = DataChannel::new(session.remote(), session.id(), stream);

    let negotiation = async {
        channel
            .send_control(&ControlMessage::ChannelOpen {
                session: session.id(),
            })
            .await?;

        match channel.next_frame().await? {
            Some(Frame::Control(body)) => match decode_control(&body)? {
                ControlMessage::ChannelReady { session: confirmed }
                    if confirmed == session.id() =>
                {
                    Ok(())
                }
                ControlMessage::ChannelReady { .. } => Err(SignalingError::SessionMismatch),
                other => Err(SignalingError::Protocol(format!(
                    "expected CHANNEL_READY, got {other:?}"
                ))),
            },
            Some(Frame::Binary(_)) => Err(SignalingError::Protocol(
                "binary frame before channel confirmation".into(),
            )),
            None => Err(SignalingError::Protocol(
                "data stream closed during negotiation".into(),
            )),
        }
    };

    match timeout(timeouts.channel_open, negotiation).await {
        Err(_) => {
            session.fail();
            Err(SignalingError::ChannelOpenTimeout(timeouts.channel_open))
        }
        Ok(Err(e)) => {
            session.fail();
            Err(e)
        }
        Ok(Ok(())) => {
            session.advance(SignalingState::Ready)?;
            tracing::info!(peer = %session.remote(), session = %session.id(), "data channel ready (outbound)");
            Ok(channel)
        }
    }
}

/// Route inbound data streams to the sessions waiting for them. A stream
/// whose first frame is not a valid hello, or that matches no pending
/// session, is dropped without affecting anything else.
pub fn spawn_data_router(mut incoming: IncomingStreams, pending: PendingChannels) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((peer, mut stream)) = incoming.next().await {
            let pending = pending.clone();
            tokio::spawn(async move {
                match timeout(HELLO_TIMEOUT, wire::read_frame(&mut stream)).await {
                    Ok(Ok(Some(Frame::Control(body)))) => match decode_control(&body) {
                        Ok(ControlMessage::ChannelOpen { session }) => {
                            let waiter = pending.lock().remove(&session);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send((peer, stream));
                                }
                                None => {
                                    tracing::warn!(%peer, %session, "data stream for unknown session");
                                }
                            }
                        }
                        other => {
                            tracing::warn!(%peer, ?other, "unexpected hello on data stream");
                        }
                    },
                    Ok(Ok(Some(Frame::Binary(_)))) => {
                        tracing::warn!(%peer, "binary frame before hello on data stream");
                    }
                    Ok(Ok(None)) | Ok(Err(_)) => {
                        tracing::debug!(%peer, "data stream closed before hello");
                    }
                    Err(_) => {
                        tracing::debug!(%peer, "data stream hello timed out");
                    }
                }
            });
        }
        tracing::debug!("data stream router stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_tags() {
        let request = ControlMessage::RequestFile {
            fingerprint: Fingerprint::hash(b"data"),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""command":"REQUEST_FILE""#));

        let complete = serde_json::to_string(&ControlMessage::TransferComplete).unwrap();
        assert_eq!(complete, r#"{"command":"TRANSFER_COMPLETE"}"#);

        // The failure variant is deliberately lowercase on the wire.
        let error = serde_json::to_string(&ControlMessage::Error {
            message: "nope".into(),
        })
        .unwrap();
        assert!(error.contains(r#""command":"error""#));
    }

    #[test]
    fn test_decode_control_roundtrip() {
        let msg = ControlMessage::ChannelOpen {
            session: Uuid::new_v4(),
        };
        let body = serde_json::to_vec(&msg).unwrap();
        assert_eq!(decode_control(&body).unwrap(), msg);

        assert!(decode_control(b"not json").is_err());
    }

    #[test]
    fn test_pending_registration() {
        let pending = new_pending();
        let session = Uuid::new_v4();

        let rx = register(&pending, session);
        assert!(pending.lock().contains_key(&session));

        unregister(&pending, &session);
        assert!(pending.lock().is_empty());
        drop(rx);

        // Unregistering an unknown session is a no-op.
        unregister(&pending, &Uuid::new_v4());
    }
}
