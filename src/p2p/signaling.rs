//! Signaling handshake
//!
//! A signaling stream carries exactly one offer/answer exchange that
//! negotiates a dedicated data channel; it never carries file bytes and is
//! closed once the answer has crossed. Each attempt walks an explicit state
//! machine, with a terminal `Failed` reachable from every non-terminal
//! state.

use super::channel::{self, ControlMessage, DataChannel, FrameSink, PendingChannels};
use super::wire::{self, WireError};
use super::DATA_PROTOCOL;

use futures::{AsyncWriteExt, StreamExt};
use libp2p::PeerId;
use libp2p_stream::IncomingStreams;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("could not open signaling stream: {0}")]
    StreamOpen(String),

    #[error("offer exchange timed out after {0:?}")]
    OfferTimeout(Duration),

    #[error("answer exchange timed out after {0:?}")]
    AnswerTimeout(Duration),

    #[error("data channel did not open within {0:?}")]
    ChannelOpenTimeout(Duration),

    #[error("remote rejected the channel offer: {0}")]
    Rejected(String),

    #[error("offer/answer session mismatch")]
    SessionMismatch,

    #[error("signaling protocol violation: {0}")]
    Protocol(String),

    #[error("invalid signaling transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SignalingState,
        to: SignalingState,
    },

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Per-leg time bounds of the handshake.
#[derive(Debug, Clone, Copy)]
pub struct SignalingTimeouts {
    /// Bound for writing the offer (or the answer, on the responder side)
    pub offer_write: Duration,

    /// Bound for waiting on the remote's half of the exchange
    pub answer_wait: Duration,

    /// Bound for the negotiated data channel to report open
    pub channel_open: Duration,
}

impl Default for SignalingTimeouts {
    fn default() -> Self {
        Self {
            offer_write: Duration::from_secs(10),
            answer_wait: Duration::from_secs(15),
            channel_open: Duration::from_secs(45),
        }
    }
}

/// Handshake states. `Failed` is terminal and reachable from every
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    StreamOpen,
    OfferSent,
    AnswerAwaited,
    AnswerReceived,
    ChannelNegotiating,
    Ready,
    Failed,
}

impl SignalingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SignalingState::Ready | SignalingState::Failed)
    }

    /// Transition table of the handshake.
    pub fn can_advance_to(self, next: SignalingState) -> bool {
        use SignalingState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, StreamOpen) => true,
            (StreamOpen, OfferSent) => true,
            (OfferSent, AnswerAwaited) => true,
            (AnswerAwaited, AnswerReceived) => true,
            (AnswerReceived, ChannelNegotiating) => true,
            (ChannelNegotiating, Ready) => true,
            _ => false,
        }
    }
}

/// Transient per-attempt handshake state. Created per connection attempt
/// and discarded after success or failure; never reused.
pub struct SignalingSession {
    id: Uuid,
    local: PeerId,
    remote: PeerId,
    state: SignalingState,
}

impl SignalingSession {
    /// New initiator-side session with a fresh session id.
    pub fn new(local: PeerId, remote: PeerId) -> Self {
        Self::with_id(local, remote, Uuid::new_v4())
    }

    /// Session bound to an id received in an offer (responder side).
    pub fn with_id(local: PeerId, remote: PeerId, id: Uuid) -> Self {
        Self {
            id,
            local,
            remote,
            state: SignalingState::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Move to the next state, rejecting transitions the table does not
    /// allow.
    pub fn advance(&mut self, next: SignalingState) -> Result<(), SignalingError> {
        if !self.state.can_advance_to(next) {
            return Err(SignalingError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(session = %self.id, from = ?self.state, to = ?next, "signaling transition");
        self.state = next;
        Ok(())
    }

    /// Mark the attempt failed. No-op once a terminal state is reached.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SignalingState::Failed;
        }
    }
}

/// Offer describing the initiator's transport parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOffer {
    pub session: Uuid,
    pub initiator: String,
    pub data_protocol: String,
}

/// Answer to a channel offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAnswer {
    pub session: Uuid,
    pub accepted: bool,
    pub data_protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Initiator half of the handshake: write the offer, wait for the answer.
/// The caller opens the stream; the stream is closed here once the answer
/// has crossed (it is never reused).
pub async fn initiate<S>(
    mut stream: S,
    session: &mut SignalingSession,
    timeouts: &SignalingTimeouts,
) -> Result<(), SignalingError>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send,
{
    session.advance(SignalingState::StreamOpen)?;

    let offer = ChannelOffer {
        session: session.id(),
        initiator: session.local().to_string(),
        data_protocol: DATA_PROTOCOL.to_string(),
    };

    match timeout(timeouts.offer_write, wire::write_json(&mut stream, &offer)).await {
        Err(_) => {
            session.fail();
            return Err(SignalingError::OfferTimeout(timeouts.offer_write));
        }
        Ok(Err(e)) => {
            session.fail();
            return Err(e.into());
        }
        Ok(Ok(())) => {}
    }
    session.advance(SignalingState::OfferSent)?;
    session.advance(SignalingState::AnswerAwaited)?;

    let answer: ChannelAnswer =
        match timeout(timeouts.answer_wait, wire::read_json(&mut stream)).await {
            Err(_) => {
                session.fail();
                return Err(SignalingError::AnswerTimeout(timeouts.answer_wait));
            }
            Ok(Err(e)) => {
                session.fail();
                return Err(e.into());
            }
            Ok(Ok(answer)) => answer,
        };

    if answer.session != session.id() {
        session.fail();
        return Err(SignalingError::SessionMismatch);
    }
    if !answer.accepted {
        session.fail();
        return Err(SignalingError::Rejected(
            answer.reason.unwrap_or_else(|| "no reason given".to_string()),
        ));
    }
    session.advance(SignalingState::AnswerReceived)?;

    let _ = stream.close().await;
    Ok(())
}

/// Called with every channel a remote peer successfully negotiates to us.
pub type ChannelSink = Arc<dyn Fn(DataChannel) + Send + Sync>;

/// Responder-side wiring shared by all inbound signaling streams.
#[derive(Clone)]
pub struct ResponderContext {
    pub local: PeerId,
    pub timeouts: SignalingTimeouts,
    pub pending: PendingChannels,
    pub on_ready: ChannelSink,
}

/// Accept inbound signaling streams, one task per stream. A stream that
/// violates the handshake only fails its own task.
pub fn spawn_responder(mut incoming: IncomingStreams, ctx: ResponderContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            tracing::debug!(%peer, "inbound signaling stream");
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_offer(peer, stream, ctx).await {
                    tracing::warn!(%peer, error = %e, "inbound signaling attempt failed");
                }
            });
        }
        tracing::debug!("signaling responder stopped");
    })
}

async fn handle_offer(
    peer: PeerId,
    mut stream: libp2p::Stream,
    ctx: ResponderContext,
) -> Result<(), SignalingError> {
    let offer: ChannelOffer = match timeout(ctx.timeouts.answer_wait, wire::read_json(&mut stream))
        .await
    {
        Err(_) => return Err(SignalingError::OfferTimeout(ctx.timeouts.answer_wait)),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(offer)) => offer,
    };

    let mut session = SignalingSession::with_id(ctx.local, peer, offer.session);
    session.advance(SignalingState::StreamOpen)?;
    session.advance(SignalingState::OfferSent)?;

    if offer.data_protocol != DATA_PROTOCOL.as_ref() {
        let answer = ChannelAnswer {
            session: offer.session,
            accepted: false,
            data_protocol: DATA_PROTOCOL.to_string(),
            reason: Some(format!("unsupported data protocol {}", offer.data_protocol)),
        };
        let _ = timeout(ctx.timeouts.offer_write, wire::write_json(&mut stream, &answer)).await;
        session.fail();
        return Err(SignalingError::Protocol(format!(
            "unsupported data protocol {}",
            offer.data_protocol
        )));
    }

    // Register before answering so the data stream cannot race the entry.
    let waiter = channel::register(&ctx.pending, session.id());

    let answer = ChannelAnswer {
        session: session.id(),
        accepted: true,
        data_protocol: DATA_PROTOCOL.to_string(),
        reason: None,
    };
    match timeout(ctx.timeouts.offer_write, wire::write_json(&mut stream, &answer)).await {
        Err(_) => {
            channel::unregister(&ctx.pending, &session.id());
            session.fail();
            return Err(SignalingError::OfferTimeout(ctx.timeouts.offer_write));
        }
        Ok(Err(e)) => {
            channel::unregister(&ctx.pending, &session.id());
            session.fail();
            return Err(e.into());
        }
        Ok(Ok(())) => {}
    }
    session.advance(SignalingState::AnswerAwaited)?;
    session.advance(SignalingState::AnswerReceived)?;
    session.advance(SignalingState::ChannelNegotiating)?;

    // The signaling stream's job is done; the channel opens separately.
    let _ = stream.close().await;

    let (data_peer, data_stream) = match timeout(ctx.timeouts.channel_open, waiter).await {
        Err(_) => {
            channel::unregister(&ctx.pending, &session.id());
            session.fail();
            return Err(SignalingError::ChannelOpenTimeout(ctx.timeouts.channel_open));
        }
        Ok(Err(_)) => {
            session.fail();
            return Err(SignalingError::Protocol("data stream router closed".into()));
        }
        Ok(Ok(matched)) => matched,
    };

    if data_peer != peer {
        session.fail();
        return Err(SignalingError::SessionMismatch);
    }

    let mut data_channel = DataChannel::new(peer, session.id(), data_stream);
    data_channel
        .send_control(&ControlMessage::ChannelReady {
            session: session.id(),
        })
        .await?;
    session.advance(SignalingState::Ready)?;

    tracing::info!(%peer, session = %session.id(), "data channel ready (inbound)");
    (ctx.on_ready)(data_channel);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> (PeerId, PeerId) {
        (PeerId::random(), PeerId::random())
    }

    #[test]
    fn test_happy_path_transitions() {
        let (local, remote) = peers();
        let mut session = SignalingSession::new(local, remote);
        assert_eq!(session.state(), SignalingState::Idle);

        for next in [
            SignalingState::StreamOpen,
            SignalingState::OfferSent,
            SignalingState::AnswerAwaited,
            SignalingState::AnswerReceived,
            SignalingState::ChannelNegotiating,
            SignalingState::Ready,
        ] {
            session.advance(next).unwrap();
            assert_eq!(session.state(), next);
        }
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let (local, remote) = peers();
        let mut session = SignalingSession::new(local, remote);

        let err = session.advance(SignalingState::OfferSent).unwrap_err();
        assert!(matches!(err, SignalingError::InvalidTransition { .. }));
        assert_eq!(session.state(), SignalingState::Idle);
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        let (local, remote) = peers();

        for reached in [
            SignalingState::Idle,
            SignalingState::StreamOpen,
            SignalingState::OfferSent,
            SignalingState::AnswerAwaited,
            SignalingState::AnswerReceived,
            SignalingState::ChannelNegotiating,
        ] {
            assert!(reached.can_advance_to(SignalingState::Failed));
        }

        let mut session = SignalingSession::new(local, remote);
        session.advance(SignalingState::StreamOpen).unwrap();
        session.fail();
        assert_eq!(session.state(), SignalingState::Failed);
    }

    #[test]
    fn test_terminal_states_do_not_move() {
        let (local, remote) = peers();
        let mut session = SignalingSession::new(local, remote);
        for next in [
            SignalingState::StreamOpen,
            SignalingState::OfferSent,
            SignalingState::AnswerAwaited,
            SignalingState::AnswerReceived,
            SignalingState::ChannelNegotiating,
            SignalingState::Ready,
        ] {
            session.advance(next).unwrap();
        }

        // A ready session must not be failable or re-advanceable.
        session.fail();
        assert_eq!(session.state(), SignalingState::Ready);
        assert!(session.advance(SignalingState::Failed).is_err());
        assert!(!SignalingState::Failed.can_advance_to(SignalingState::Failed));
    }

    /// A responder that accepts the offer bytes but never answers.
    #[derive(Default)]
    struct SilentResponder {
        written: Vec<u8>,
    }

    impl futures::AsyncWrite for SilentResponder {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.written.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl futures::AsyncRead for SilentResponder {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut [u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_offer_times_out() {
        let (local, remote) = peers();
        let mut session = SignalingSession::new(local, remote);
        let timeouts = SignalingTimeouts::default();

        let err = initiate(SilentResponder::default(), &mut session, &timeouts)
            .await
            .unwrap_err();

        assert!(matches!(err, SignalingError::AnswerTimeout(d) if d == timeouts.answer_wait));
        assert_eq!(session.state(), SignalingState::Failed);
    }

    #[test]
    fn test_offer_answer_serde() {
        let offer = ChannelOffer {
            session: Uuid::new_v4(),
            initiator: PeerId::random().to_string(),
            data_protocol: DATA_PROTOCOL.to_string(),
        };
        let json = serde_json::to_string(&offer).unwrap();
        let back: ChannelOffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session, offer.session);

        let answer = ChannelAnswer {
            session: offer.session,
            accepted: true,
            data_protocol: DATA_PROTOCOL.to_string(),
            reason: None,
        };
        let json = serde_json::to_string(&answer).unwrap();
        assert!(!json.contains("reason"));
    }
}
