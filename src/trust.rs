//! Trust scoring for remote peers
//!
//! A trust score is a locally computed reliability estimate in [0, 1],
//! nudged by transfer outcomes. Scores are never accepted from a peer; they
//! only influence provider ranking and never make a peer ineligible.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Score assigned to a peer on first registration.
pub const INITIAL_SCORE: f64 = 0.50;

/// Upward step applied on a successful transfer.
pub const SUCCESS_STEP: f64 = 0.05;

/// Downward step applied on a failed transfer. Failures bite harder than
/// successes reward.
pub const FAILURE_STEP: f64 = 0.10;

/// Apply one transfer outcome to a score, keeping the result in [0, 1].
pub fn nudge(score: f64, success: bool) -> f64 {
    let next = if success {
        score + SUCCESS_STEP
    } else {
        score - FAILURE_STEP
    };
    next.clamp(0.0, 1.0)
}

/// Persisted trust state for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRecord {
    pub peer_id: String,
    pub score: f64,
    pub successes: u64,
    pub failures: u64,
    pub updated_at: DateTime<Utc>,
}

impl TrustRecord {
    /// Fresh record for a newly registered peer.
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            score: INITIAL_SCORE,
            successes: 0,
            failures: 0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one transfer outcome into the record.
    pub fn apply_outcome(&mut self, success: bool) {
        self.score = nudge(self.score, success);
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.updated_at = Utc::now();
    }
}

/// Interface to the persisted trust store. Single-row, last-writer-wins;
/// the core only reads and updates through this boundary.
pub trait TrustStore: Send + Sync {
    fn get(&self, peer_id: &str) -> Option<TrustRecord>;
    fn put(&self, record: TrustRecord);
}

/// In-memory trust store.
#[derive(Default)]
pub struct MemoryTrustStore {
    records: RwLock<HashMap<String, TrustRecord>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn get(&self, peer_id: &str) -> Option<TrustRecord> {
        self.records.read().get(peer_id).cloned()
    }

    fn put(&self, record: TrustRecord) {
        self.records.write().insert(record.peer_id.clone(), record);
    }
}

/// Trust ledger: ranking input for provider selection.
#[derive(Clone)]
pub struct TrustLedger {
    store: Arc<dyn TrustStore>,
}

impl TrustLedger {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }

    /// In-memory ledger, used when no persisted store is wired in.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTrustStore::new()))
    }

    /// Current score for a peer; unseen peers start at [`INITIAL_SCORE`].
    pub fn score(&self, peer_id: &str) -> f64 {
        self.store
            .get(peer_id)
            .map(|r| r.score)
            .unwrap_or(INITIAL_SCORE)
    }

    /// Record a transfer outcome and return the updated score.
    pub fn record_outcome(&self, peer_id: &str, success: bool) -> f64 {
        let mut record = self
            .store
            .get(peer_id)
            .unwrap_or_else(|| TrustRecord::new(peer_id));
        record.apply_outcome(success);
        let score = record.score;
        self.store.put(record);
        tracing::debug!(peer = %peer_id, success, score, "recorded transfer outcome");
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_score() {
        let ledger = TrustLedger::in_memory();
        assert_eq!(ledger.score("unseen"), INITIAL_SCORE);
    }

    #[test]
    fn test_success_and_failure_nudges() {
        let ledger = TrustLedger::in_memory();

        let up = ledger.record_outcome("peer-a", true);
        assert!(up > INITIAL_SCORE);

        let down = ledger.record_outcome("peer-b", false);
        assert!(down < INITIAL_SCORE);
    }

    #[test]
    fn test_score_stays_bounded() {
        let ledger = TrustLedger::in_memory();

        for _ in 0..100 {
            ledger.record_outcome("saint", true);
        }
        assert!(ledger.score("saint") <= 1.0);

        for _ in 0..100 {
            ledger.record_outcome("sinner", false);
        }
        assert!(ledger.score("sinner") >= 0.0);

        // Mixed sequences stay bounded too.
        for i in 0..50 {
            ledger.record_outcome("mixed", i % 3 == 0);
        }
        let score = ledger.score("mixed");
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_outcome_counters() {
        let store = Arc::new(MemoryTrustStore::new());
        let ledger = TrustLedger::new(store.clone());

        ledger.record_outcome("peer", true);
        ledger.record_outcome("peer", true);
        ledger.record_outcome("peer", false);

        let record = store.get("peer").unwrap();
        assert_eq!(record.successes, 2);
        assert_eq!(record.failures, 1);
    }
}
