//! Provider discovery
//!
//! Two interchangeable strategies resolve a content fingerprint to a set of
//! candidate peers: an asynchronous DHT provider search and a tracker
//! query. Zero candidates is a valid, non-error outcome for both.

use super::node::NodeHandle;
use super::P2PError;
use crate::crypto::Fingerprint;
use crate::tracker::client::TrackerSession;
use crate::tracker::TrackerError;
use crate::trust::TrustLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(transparent)]
    Network(#[from] P2PError),

    #[error("tracker query failed: {0}")]
    Tracker(#[from] TrackerError),
}

/// A peer that may hold the requested content.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub peer: PeerId,

    /// Known addresses, possibly empty (resolved later by the
    /// orchestrator)
    pub addrs: Vec<Multiaddr>,

    /// Trust score reported at query time, if the strategy provides one
    pub trust: Option<f64>,

    /// When the peer announced the content, if known
    pub announced_at: Option<DateTime<Utc>>,
}

/// Discovery contract: resolve a fingerprint to candidate providers.
#[async_trait]
pub trait ProviderDiscovery: Send + Sync {
    /// Collect up to `max_results` candidates within `timeout`. Partial
    /// results on timeout are still returned; "zero found" is never an
    /// error.
    async fn resolve_providers(
        &self,
        fingerprint: &Fingerprint,
        timeout: Duration,
        max_results: usize,
    ) -> Result<Vec<Candidate>, DiscoveryError>;
}

/// DHT-backed discovery: collects providers as the Kademlia query
/// progresses, ordered by arrival, excluding ourselves.
pub struct DhtDiscovery {
    node: NodeHandle,
}

impl DhtDiscovery {
    pub fn new(node: NodeHandle) -> Self {
        Self { node }
    }
}

#[async_trait]
impl ProviderDiscovery for DhtDiscovery {
    async fn resolve_providers(
        &self,
        fingerprint: &Fingerprint,
        timeout: Duration,
        max_results: usize,
    ) -> Result<Vec<Candidate>, DiscoveryError> {
        let mut providers = self
            .node
            .provider_stream(fingerprint.as_bytes().to_vec())
            .await
            .map_err(DiscoveryError::Network)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut candidates = Vec::new();
        let mut total_found = 0usize;

        loop {
            tokio::select! {
                provider = providers.recv() => match provider {
                    Some(peer) => {
                        total_found += 1;
                        if peer != self.node.local_peer_id() && seen.insert(peer) {
                            candidates.push(Candidate {
                                peer,
                                addrs: vec![],
                                trust: None,
                                announced_at: None,
                            });
                            if candidates.len() >= max_results {
                                break;
                            }
                        }
                    }
                    // Query finished on its own.
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        found = candidates.len(),
                        "provider search timed out, returning partial results"
                    );
                    break;
                }
            }
        }

        tracing::debug!(
            fingerprint = %fingerprint,
            total = total_found,
            unique = candidates.len(),
            "provider search complete"
        );
        Ok(candidates)
    }
}

/// Tracker-backed discovery: queries the tracker session and returns
/// candidates in the tracker's trust-ranked order, with addresses filled
/// from peer info lookups.
pub struct TrackerDiscovery {
    session: Arc<TrackerSession>,
    local_peer: PeerId,
}

impl TrackerDiscovery {
    pub fn new(session: Arc<TrackerSession>, local_peer: PeerId) -> Self {
        Self {
            session,
            local_peer,
        }
    }
}

#[async_trait]
impl ProviderDiscovery for TrackerDiscovery {
    async fn resolve_providers(
        &self,
        fingerprint: &Fingerprint,
        timeout: Duration,
        max_results: usize,
    ) -> Result<Vec<Candidate>, DiscoveryError> {
        let query = async {
            let entries = self.session.providers_for(fingerprint).await?;

            let mut candidates = Vec::new();
            for entry in entries {
                if candidates.len() >= max_results {
                    break;
                }
                let peer: PeerId = match entry.peer_id.parse() {
                    Ok(peer) => peer,
                    Err(_) => {
                        tracing::warn!(peer = %entry.peer_id, "tracker returned unparseable peer id");
                        continue;
                    }
                };
                if peer == self.local_peer {
                    continue;
                }

                let addrs = match self.session.peer_info(&entry.peer_id).await {
                    Ok(info) => info
                        .addrs
                        .iter()
                        .filter_map(|a| a.parse().ok())
                        .collect(),
                    Err(e) => {
                        tracing::debug!(peer = %entry.peer_id, error = %e, "peer info lookup failed");
                        vec![]
                    }
                };

                candidates.push(Candidate {
                    peer,
                    addrs,
                    trust: Some(entry.score),
                    announced_at: Some(entry.announced_at),
                });
            }
            Ok::<_, DiscoveryError>(candidates)
        };

        match tokio::time::timeout(timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Network(P2PError::Timeout(timeout))),
        }
    }
}

/// Order candidates by descending trust, preferring a strategy-reported
/// score and falling back to the local ledger. The sort is stable, so
/// arrival order survives among equally trusted peers.
pub fn rank_by_trust(candidates: &mut [Candidate], ledger: &TrustLedger) {
    candidates.sort_by(|a, b| {
        let score_a = a.trust.unwrap_or_else(|| ledger.score(&a.peer.to_string()));
        let score_b = b.trust.unwrap_or_else(|| ledger.score(&b.peer.to_string()));
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(peer: PeerId, trust: Option<f64>) -> Candidate {
        Candidate {
            peer,
            addrs: vec![],
            trust,
            announced_at: None,
        }
    }

    #[test]
    fn test_rank_by_trust_prefers_reported_scores() {
        let ledger = TrustLedger::in_memory();
        let low = PeerId::random();
        let high = PeerId::random();

        let mut candidates = vec![candidate(low, Some(0.2)), candidate(high, Some(0.9))];
        rank_by_trust(&mut candidates, &ledger);

        assert_eq!(candidates[0].peer, high);
        assert_eq!(candidates[1].peer, low);
    }

    #[test]
    fn test_rank_by_trust_falls_back_to_ledger() {
        let ledger = TrustLedger::in_memory();
        let trusted = PeerId::random();
        let neutral = PeerId::random();
        for _ in 0..4 {
            ledger.record_outcome(&trusted.to_string(), true);
        }

        let mut candidates = vec![candidate(neutral, None), candidate(trusted, None)];
        rank_by_trust(&mut candidates, &ledger);

        assert_eq!(candidates[0].peer, trusted);
    }

    #[test]
    fn test_rank_is_stable_for_ties() {
        let ledger = TrustLedger::in_memory();
        let first = PeerId::random();
        let second = PeerId::random();

        // Equal scores: arrival order must survive.
        let mut candidates = vec![candidate(first, Some(0.5)), candidate(second, Some(0.5))];
        rank_by_trust(&mut candidates, &ledger);

        assert_eq!(candidates[0].peer, first);
        assert_eq!(candidates[1].peer, second);
    }
}
