//! Tracker registry: peers, files, provider links and trust rows
//!
//! One reader/writer lock guards the whole registry, so each compound
//! mutation (peer upsert plus its initial trust row, file insert plus
//! provider link) commits atomically with respect to readers.

use super::TrackerError;
use crate::crypto::Fingerprint;
use crate::trust::TrustRecord;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A peer known to the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Opaque peer identity, stable across restarts
    pub peer_id: String,

    /// Declared display name
    pub name: String,

    /// Reachable addresses declared at handshake
    pub addrs: Vec<String>,

    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A file announced to the tracker. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Link between a peer and a file it provides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLink {
    pub fingerprint: Fingerprint,
    pub peer_id: String,
    pub announced_at: DateTime<Utc>,
}

/// Provider query result: the link plus the peer's trust score at query
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub peer_id: String,
    pub fingerprint: Fingerprint,
    pub score: f64,
    pub announced_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<String, PeerRecord>,
    files: HashMap<Fingerprint, FileRecord>,
    // (fingerprint, peer_id) -> link; unique per pair
    links: HashMap<(Fingerprint, String), ProviderLink>,
    trust: HashMap<String, TrustRecord>,
}

/// Tracker-side registry. Constructed once and shared by reference; no
/// ambient state.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. New peers get a trust row at the initial
    /// score in the same write; existing peers are marked online and their
    /// addresses and last-seen refreshed.
    pub fn upsert_peer(&self, peer_id: &str, name: &str, addrs: Vec<String>) -> PeerRecord {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let record = match inner.peers.entry(peer_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                peer.online = true;
                peer.last_seen = now;
                peer.addrs = addrs;
                if !name.is_empty() {
                    peer.name = name.to_string();
                }
                peer.clone()
            }
            std::collections::hash_map::Entry::Vacant(entry) => entry
                .insert(PeerRecord {
                    peer_id: peer_id.to_string(),
                    name: name.to_string(),
                    addrs,
                    online: true,
                    last_seen: now,
                    created_at: now,
                })
                .clone(),
        };

        inner
            .trust
            .entry(peer_id.to_string())
            .or_insert_with(|| TrustRecord::new(peer_id));

        record
    }

    /// Mark one peer offline (stream closed or decode error).
    pub fn set_offline(&self, peer_id: &str) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.online = false;
            peer.last_seen = Utc::now();
        }
    }

    /// Clear every online flag. Runs at service start, before any new
    /// handshake is accepted.
    pub fn mark_all_offline(&self) {
        let mut inner = self.inner.write();
        for peer in inner.peers.values_mut() {
            peer.online = false;
        }
    }

    /// Announce a file for a peer. Idempotent on the content fingerprint:
    /// repeated announces return the same file id, and re-linking the same
    /// (peer, file) pair is a no-op.
    pub fn announce(
        &self,
        peer_id: &str,
        fingerprint: Fingerprint,
        filename: &str,
        size: u64,
    ) -> Result<Uuid, TrackerError> {
        let mut inner = self.inner.write();
        if !inner.peers.contains_key(peer_id) {
            return Err(TrackerError::UnknownPeer(peer_id.to_string()));
        }

        let now = Utc::now();
        let file_id = inner
            .files
            .entry(fingerprint)
            .or_insert_with(|| FileRecord {
                id: Uuid::new_v4(),
                fingerprint,
                filename: filename.to_string(),
                size,
                created_at: now,
            })
            .id;

        inner
            .links
            .entry((fingerprint, peer_id.to_string()))
            .or_insert_with(|| ProviderLink {
                fingerprint,
                peer_id: peer_id.to_string(),
                announced_at: now,
            });

        Ok(file_id)
    }

    /// All announced files, newest first.
    pub fn files(&self) -> Vec<FileRecord> {
        let inner = self.inner.read();
        let mut files: Vec<FileRecord> = inner.files.values().cloned().collect();
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        files
    }

    /// Online providers of a file, ordered by descending trust score with
    /// ties broken by announcement recency. An unknown fingerprint yields
    /// an empty list, not an error.
    pub fn online_providers(&self, fingerprint: &Fingerprint) -> Vec<ProviderEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<ProviderEntry> = inner
            .links
            .values()
            .filter(|link| {
                link.fingerprint == *fingerprint
                    && inner
                        .peers
                        .get(&link.peer_id)
                        .map(|p| p.online)
                        .unwrap_or(false)
            })
            .map(|link| ProviderEntry {
                peer_id: link.peer_id.clone(),
                fingerprint: link.fingerprint,
                score: inner
                    .trust
                    .get(&link.peer_id)
                    .map(|t| t.score)
                    .unwrap_or(crate::trust::INITIAL_SCORE),
                announced_at: link.announced_at,
            })
            .collect();

        entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.announced_at.cmp(&a.announced_at))
        });
        entries
    }

    /// Look up a peer by identity.
    pub fn peer_info(&self, peer_id: &str) -> Option<PeerRecord> {
        self.inner.read().peers.get(peer_id).cloned()
    }

    /// All currently online peers.
    pub fn online_peers(&self) -> Vec<PeerRecord> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| p.online)
            .cloned()
            .collect()
    }

    /// Fold a transfer outcome into a peer's trust row.
    pub fn record_outcome(&self, peer_id: &str, success: bool) {
        let mut inner = self.inner.write();
        let record = inner
            .trust
            .entry(peer_id.to_string())
            .or_insert_with(|| TrustRecord::new(peer_id));
        record.apply_outcome(success);
    }

    /// Current trust score for a peer.
    pub fn trust_score(&self, peer_id: &str) -> f64 {
        self.inner
            .read()
            .trust
            .get(peer_id)
            .map(|t| t.score)
            .unwrap_or(crate::trust::INITIAL_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(data: &[u8]) -> Fingerprint {
        Fingerprint::hash(data)
    }

    #[test]
    fn test_upsert_creates_trust_row() {
        let registry = Registry::new();
        let peer = registry.upsert_peer("peer-1", "alice", vec!["/ip4/1.2.3.4/tcp/1".into()]);

        assert!(peer.online);
        assert_eq!(registry.trust_score("peer-1"), crate::trust::INITIAL_SCORE);
    }

    #[test]
    fn test_upsert_refreshes_existing_peer() {
        let registry = Registry::new();
        registry.upsert_peer("peer-1", "alice", vec!["/ip4/1.2.3.4/tcp/1".into()]);
        registry.set_offline("peer-1");
        registry.record_outcome("peer-1", true);

        let peer = registry.upsert_peer("peer-1", "alice", vec!["/ip4/5.6.7.8/tcp/2".into()]);
        assert!(peer.online);
        assert_eq!(peer.addrs, vec!["/ip4/5.6.7.8/tcp/2".to_string()]);
        // Re-handshaking must not reset the trust row.
        assert!(registry.trust_score("peer-1") > crate::trust::INITIAL_SCORE);
    }

    #[test]
    fn test_announce_is_idempotent_on_fingerprint() {
        let registry = Registry::new();
        registry.upsert_peer("peer-1", "alice", vec![]);

        let first = registry.announce("peer-1", fp(b"data"), "data.bin", 4).unwrap();
        let second = registry.announce("peer-1", fp(b"data"), "data.bin", 4).unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.files().len(), 1);
    }

    #[test]
    fn test_link_is_idempotent_per_pair() {
        let registry = Registry::new();
        registry.upsert_peer("peer-1", "alice", vec![]);

        registry.announce("peer-1", fp(b"data"), "data.bin", 4).unwrap();
        registry.announce("peer-1", fp(b"data"), "data.bin", 4).unwrap();

        assert_eq!(registry.online_providers(&fp(b"data")).len(), 1);
    }

    #[test]
    fn test_announce_requires_known_peer() {
        let registry = Registry::new();
        let err = registry.announce("ghost", fp(b"data"), "data.bin", 4);
        assert!(matches!(err, Err(TrackerError::UnknownPeer(_))));
    }

    #[test]
    fn test_providers_ranked_by_trust_then_recency() {
        let registry = Registry::new();
        registry.upsert_peer("low", "l", vec![]);
        registry.upsert_peer("high", "h", vec![]);
        registry.upsert_peer("mid-old", "m1", vec![]);

        registry.announce("mid-old", fp(b"data"), "data.bin", 4).unwrap();
        registry.announce("low", fp(b"data"), "data.bin", 4).unwrap();
        registry.announce("high", fp(b"data"), "data.bin", 4).unwrap();

        registry.record_outcome("high", true);
        registry.record_outcome("low", false);

        let providers = registry.online_providers(&fp(b"data"));
        let order: Vec<&str> = providers.iter().map(|p| p.peer_id.as_str()).collect();
        // high > (mid-old vs low tie broken below) and low nudged down.
        assert_eq!(order[0], "high");
        assert_eq!(order[2], "low");
    }

    #[test]
    fn test_offline_providers_excluded() {
        let registry = Registry::new();
        registry.upsert_peer("peer-1", "alice", vec![]);
        registry.announce("peer-1", fp(b"data"), "data.bin", 4).unwrap();

        registry.set_offline("peer-1");
        assert!(registry.online_providers(&fp(b"data")).is_empty());
    }

    #[test]
    fn test_unknown_fingerprint_is_empty_not_error() {
        let registry = Registry::new();
        assert!(registry.online_providers(&fp(b"never announced")).is_empty());
    }

    #[test]
    fn test_mark_all_offline() {
        let registry = Registry::new();
        registry.upsert_peer("a", "a", vec![]);
        registry.upsert_peer("b", "b", vec![]);
        assert_eq!(registry.online_peers().len(), 2);

        registry.mark_all_offline();
        assert!(registry.online_peers().is_empty());
    }
}
