//! Channel orchestrator
//!
//! Turns "I want a channel to peer P" into a ready data channel or a
//! definitive failure. Each attempt resolves addresses, verifies
//! connectivity, then runs the signaling handshake with escalating stream
//! timeouts; the whole attempt is retried a bounded number of times with
//! exponential backoff. Intermediate failures are logged and drive the next
//! retry; only the final `RetriesExhausted` (wrapping the last concrete
//! cause) reaches the caller.

use super::channel::{self, DataChannel};
use super::node::NodeHandle;
use super::signaling::{self, SignalingError, SignalingSession, SignalingTimeouts};
use super::{P2PError, SIGNALING_PROTOCOL};

use futures::AsyncWriteExt;
use libp2p::{Multiaddr, PeerId};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("no known addresses for {peer} after all resolution attempts")]
    AddressResolutionFailed { peer: PeerId },

    #[error("connect to {peer} failed")]
    ConnectFailed {
        peer: PeerId,
        #[source]
        source: P2PError,
    },

    #[error("connection to {peer} is not ready for streams")]
    NotReady { peer: PeerId },

    #[error("signaling handshake with {peer} failed")]
    HandshakeFailed {
        peer: PeerId,
        #[source]
        source: SignalingError,
    },

    #[error("data channel to {peer} did not open within {waited:?}")]
    ChannelTimeout { peer: PeerId, waited: Duration },

    #[error("gave up on {peer} after {attempts} connection attempts")]
    RetriesExhausted {
        peer: PeerId,
        attempts: usize,
        #[source]
        source: Box<ConnectError>,
    },
}

/// Timeout and retry schedule of the orchestrator. Every suspension point
/// it drives is bounded by one of these.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Full connection attempts before giving up
    pub outer_attempts: usize,

    /// Base of the exponential backoff between attempts (2s, 4s, 8s, ...)
    pub outer_backoff_base: Duration,

    /// Escalating per-attempt stream creation timeouts
    pub stream_timeouts: Vec<Duration>,

    /// Base of the backoff between stream creation attempts
    pub stream_backoff_base: Duration,

    /// Bound for writing the channel offer
    pub offer_write: Duration,

    /// Bound for waiting on the channel answer
    pub answer_wait: Duration,

    /// Bound for the negotiated channel to report open
    pub channel_open: Duration,

    /// Bound for the first DHT address lookup
    pub lookup_timeout: Duration,

    /// Grace period after a routing-table refresh
    pub refresh_grace: Duration,

    /// Bound for the post-refresh lookup retry
    pub retry_lookup_timeout: Duration,

    /// Bound for establishing a connection
    pub connect_timeout: Duration,

    /// Settling delay after a fresh connection
    pub stabilize: Duration,

    /// Bound for the live capability probe
    pub probe_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            outer_attempts: 3,
            outer_backoff_base: Duration::from_secs(2),
            stream_timeouts: vec![
                Duration::from_secs(15),
                Duration::from_secs(30),
                Duration::from_secs(45),
            ],
            stream_backoff_base: Duration::from_secs(2),
            offer_write: Duration::from_secs(10),
            answer_wait: Duration::from_secs(15),
            channel_open: Duration::from_secs(45),
            lookup_timeout: Duration::from_secs(30),
            refresh_grace: Duration::from_secs(5),
            retry_lookup_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(45),
            stabilize: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before outer attempt `attempt` (1-based; the first attempt
    /// has none): 2s, 4s, 8s, ...
    pub fn outer_backoff(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(6) as u32;
        self.outer_backoff_base * (1u32 << exponent)
    }

    /// Backoff after the stream creation attempt at `index` (0-based):
    /// 2s, 4s, 8s, ...
    pub fn stream_backoff(&self, index: usize) -> Duration {
        let exponent = index.min(6) as u32;
        self.stream_backoff_base * (1u32 << exponent)
    }

    fn signaling_timeouts(&self) -> SignalingTimeouts {
        SignalingTimeouts {
            offer_write: self.offer_write,
            answer_wait: self.answer_wait,
            channel_open: self.channel_open,
        }
    }
}

/// Drives connection establishment to a single peer at a time.
pub struct ChannelOrchestrator {
    node: NodeHandle,
    policy: RetryPolicy,
}

impl ChannelOrchestrator {
    pub fn new(node: NodeHandle, policy: RetryPolicy) -> Self {
        Self { node, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Establish a ready data channel to `peer`, masking transient
    /// failures. Each attempt cleans up its own partial state.
    pub async fn establish(&self, peer: PeerId) -> Result<DataChannel, ConnectError> {
        run_with_retries(&self.policy, peer, |attempt| {
            self.attempt_channel(peer, attempt)
        })
        .await
    }

    /// Two-tier capability check: the identify cache first, then a live
    /// probe (a minimal stream open, closed immediately).
    pub async fn supports_signaling(&self, peer: PeerId) -> bool {
        if let Ok(protocols) = self.node.supported_protocols(peer).await {
            if protocols.iter().any(|p| p == SIGNALING_PROTOCOL.as_ref()) {
                return true;
            }
        }

        match timeout(
            self.policy.probe_timeout,
            self.node.open_stream(peer, SIGNALING_PROTOCOL),
        )
        .await
        {
            Ok(Ok(mut stream)) => {
                let _ = stream.close().await;
                true
            }
            _ => false,
        }
    }

    async fn attempt_channel(
        &self,
        peer: PeerId,
        attempt: usize,
    ) -> Result<DataChannel, ConnectError> {
        tracing::debug!(%peer, attempt, "starting connection attempt");

        let addrs = self.resolve_addresses(peer).await?;
        self.ensure_connected(peer, addrs.clone()).await?;

        // Do not try to open streams on a connection that is not live.
        match self.node.is_connected(peer).await {
            Ok(true) => {}
            Ok(false) => return Err(ConnectError::NotReady { peer }),
            Err(e) => return Err(ConnectError::ConnectFailed { peer, source: e }),
        }

        self.handshake_with_escalation(peer, addrs).await
    }

    /// Cached addresses first; otherwise a DHT lookup, and after a
    /// routing-table refresh plus grace period, one final lookup.
    async fn resolve_addresses(&self, peer: PeerId) -> Result<Vec<Multiaddr>, ConnectError> {
        let cached = self
            .node
            .cached_addresses(peer)
            .await
            .map_err(|e| ConnectError::ConnectFailed { peer, source: e })?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        tracing::debug!(%peer, "no cached addresses, resolving via DHT");
        match self.node.lookup_peer(peer, self.policy.lookup_timeout).await {
            Ok(addrs) if !addrs.is_empty() => {
                tracing::debug!(%peer, count = addrs.len(), "found addresses via DHT");
                return Ok(addrs);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(%peer, error = %e, "DHT lookup failed"),
        }

        tracing::debug!(%peer, "refreshing routing table and retrying lookup");
        let _ = self.node.refresh_routing_table().await;
        sleep(self.policy.refresh_grace).await;

        match self
            .node
            .lookup_peer(peer, self.policy.retry_lookup_timeout)
            .await
        {
            Ok(addrs) if !addrs.is_empty() => Ok(addrs),
            _ => Err(ConnectError::AddressResolutionFailed { peer }),
        }
    }

    async fn ensure_connected(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Result<(), ConnectError> {
        if matches!(self.node.is_connected(peer).await, Ok(true)) {
            return Ok(());
        }

        self.node
            .dial(peer, addrs, self.policy.connect_timeout)
            .await
            .map_err(|e| ConnectError::ConnectFailed { peer, source: e })?;
        tracing::debug!(%peer, "connected");

        sleep(self.policy.stabilize).await;
        Ok(())
    }

    /// Signaling attempts with escalating stream timeouts, reconnecting if
    /// the connection drops between attempts.
    async fn handshake_with_escalation(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> Result<DataChannel, ConnectError> {
        let stream_timeouts = self.policy.stream_timeouts.clone();
        let mut last: Option<ConnectError> = None;

        for (index, stream_timeout) in stream_timeouts.iter().enumerate() {
            tracing::debug!(
                %peer,
                attempt = index + 1,
                of = stream_timeouts.len(),
                timeout = ?stream_timeout,
                "signaling attempt"
            );

            match self.try_handshake(peer, *stream_timeout).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    tracing::warn!(%peer, attempt = index + 1, error = %e, "signaling attempt failed");
                    last = Some(e);
                }
            }

            if index + 1 < stream_timeouts.len() {
                sleep(self.policy.stream_backoff(index)).await;

                if !matches!(self.node.is_connected(peer).await, Ok(true)) {
                    tracing::debug!(%peer, "connection lost, reconnecting");
                    self.node
                        .dial(peer, addrs.clone(), self.policy.connect_timeout)
                        .await
                        .map_err(|e| ConnectError::ConnectFailed { peer, source: e })?;
                    sleep(self.policy.stabilize).await;
                }
            }
        }

        Err(last.unwrap_or(ConnectError::NotReady { peer }))
    }

    async fn try_handshake(
        &self,
        peer: PeerId,
        stream_timeout: Duration,
    ) -> Result<DataChannel, ConnectError> {
        let mut session = SignalingSession::new(self.node.local_peer_id(), peer);

        let stream = match timeout(
            stream_timeout,
            self.node.open_stream(peer, SIGNALING_PROTOCOL),
        )
        .await
        {
            Err(_) => {
                return Err(ConnectError::HandshakeFailed {
                    peer,
                    source: SignalingError::StreamOpen(format!(
                        "stream open timed out after {stream_timeout:?}"
                    )),
                })
            }
            Ok(Err(e)) => {
                return Err(ConnectError::HandshakeFailed {
                    peer,
                    source: SignalingError::StreamOpen(e.to_string()),
                })
            }
            Ok(Ok(stream)) => stream,
        };

        let timeouts = self.policy.signaling_timeouts();
        signaling::initiate(stream, &mut session, &timeouts)
            .await
            .map_err(|e| ConnectError::HandshakeFailed { peer, source: e })?;

        channel::open_channel(&self.node, &mut session, &timeouts)
            .await
            .map_err(|e| match e {
                SignalingError::ChannelOpenTimeout(waited) => {
                    ConnectError::ChannelTimeout { peer, waited }
                }
                other => ConnectError::HandshakeFailed {
                    peer,
                    source: other,
                },
            })
    }
}

/// Outer retry loop. Attempts are independent; only the final error (with
/// the last concrete cause attached) escapes.
async fn run_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    peer: PeerId,
    mut attempt_fn: F,
) -> Result<T, ConnectError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, ConnectError>>,
{
    let attempts = policy.outer_attempts.max(1);
    let mut last: Option<ConnectError> = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            let backoff = policy.outer_backoff(attempt) + jitter;
            tracing::debug!(%peer, attempt, of = attempts, ?backoff, "retrying after backoff");
            sleep(backoff).await;
        }

        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(%peer, attempt, error = %e, "connection attempt failed");
                last = Some(e);
            }
        }
    }

    Err(ConnectError::RetriesExhausted {
        peer,
        attempts,
        source: Box::new(last.unwrap_or(ConnectError::NotReady { peer })),
    })
}
