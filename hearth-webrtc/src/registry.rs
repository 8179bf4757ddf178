use crate::config::IceConfig;
use crate::error::WebrtcError;
use crate::peer::Peer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// Owns the set of live peer connections of one session, keyed by remote
/// user identity. At most one entry per user.
///
/// The registry is only ever mutated by the session's coordinator task in
/// direct response to an envelope or a public operation call; no background
/// timer touches it.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a connection for `user_id`. Fails with
    /// [`WebrtcError::DuplicateConnection`] if one already exists.
    #[instrument(level = "debug", skip(self, config), err)]
    pub async fn create(&self, user_id: &str, config: IceConfig) -> Result<Arc<Peer>, WebrtcError> {
        if self.peers.lock().contains_key(user_id) {
            tracing::warn!(user_id, "Connection already exists");
            return Err(WebrtcError::DuplicateConnection(user_id.to_string()));
        }

        let peer = Arc::new(Peer::new(user_id, config).await?);

        let inserted = {
            let mut peers = self.peers.lock();
            if peers.contains_key(user_id) {
                false
            } else {
                peers.insert(user_id.to_string(), Arc::clone(&peer));
                true
            }
        };

        if !inserted {
            // Lost a race against another create for the same user.
            tracing::warn!(user_id, "Connection registered concurrently");
            let _ = peer.close().await;
            return Err(WebrtcError::DuplicateConnection(user_id.to_string()));
        }

        tracing::debug!(user_id, "Registered peer connection");
        Ok(peer)
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Peer>> {
        self.peers.lock().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.peers.lock().contains_key(user_id)
    }

    /// Removes and closes the connection for `user_id`, releasing its
    /// transport resources. Removing an absent entry is a no-op.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove(&self, user_id: &str) -> bool {
        let peer = self.peers.lock().remove(user_id);
        match peer {
            Some(peer) => {
                if let Err(err) = peer.close().await {
                    tracing::warn!(?err, user_id, "Failed to close removed peer connection");
                }
                true
            }
            None => {
                tracing::trace!(user_id, "No connection to remove");
                false
            }
        }
    }

    /// Snapshot of all live connections.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Sorted snapshot of all connected user identities.
    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Removes and closes every connection. Used on session teardown.
    #[instrument(level = "debug", skip(self))]
    pub async fn clear(&self) {
        let peers = {
            let mut peers = self.peers.lock();
            std::mem::take(&mut *peers)
        };
        for (user_id, peer) in peers {
            if let Err(err) = peer.close().await {
                tracing::warn!(?err, user_id, "Failed to close peer connection");
            }
        }
    }
}
