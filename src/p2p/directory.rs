//! Peer directory
//!
//! Process-local registry of live data channels, keyed by peer identity.
//! Readers run concurrently; writers are exclusive. Constructed once and
//! passed by reference to every component that needs it.

use super::channel::ChannelHandle;

use libp2p::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct PeerDirectory {
    channels: RwLock<HashMap<PeerId, ChannelHandle>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live channel, returning the handle it replaced, if any.
    /// The caller is responsible for closing a replaced channel.
    pub fn insert(&self, handle: ChannelHandle) -> Option<ChannelHandle> {
        self.channels.write().insert(handle.peer(), handle)
    }

    pub fn get(&self, peer: &PeerId) -> Option<ChannelHandle> {
        self.channels.read().get(peer).cloned()
    }

    pub fn remove(&self, peer: &PeerId) -> Option<ChannelHandle> {
        self.channels.write().remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.channels.read().contains_key(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.channels.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Close every registered channel. Used on shutdown; remote peers
    /// observe end of stream and wind down their side.
    pub async fn close_all(&self) {
        let handles: Vec<ChannelHandle> = {
            let mut map = self.channels.write();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }
}
