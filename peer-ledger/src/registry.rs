use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::warn;

use crate::{config::DuplicatePolicy, error::LedgerError, peer::Peer};

/// Connected peers keyed by id.
///
/// [`register`](Registry::register), [`unregister`](Registry::unregister) and
/// [`lookup`](Registry::lookup) are the unconditional map operations.
/// Connection handlers go through [`admit`](Registry::admit) and
/// [`unregister_peer`](Registry::unregister_peer), which add the duplicate-id
/// policy, the capacity limit and an identity check on top of the same
/// insertion and removal.
///
/// Every method takes the lock only for the map access itself; nothing here
/// awaits I/O while holding it. Balances are not guarded by this lock, see
/// [`Peer`].
#[derive(Debug, Default)]
pub struct Registry {
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    capacity: Option<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that refuses admission once `capacity` peers are registered.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    /// Inserts `peer`, overwriting any entry with the same id.
    ///
    /// The displaced peer, if any, is returned. Its connection keeps running
    /// but it can no longer be found by [`Registry::lookup`].
    pub async fn register(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let mut peers = self.peers.lock().await;
        insert(&mut peers, peer)
    }

    /// Registers `peer` after applying the duplicate-id policy and the
    /// capacity limit.
    pub async fn admit(&self, peer: Arc<Peer>, policy: DuplicatePolicy) -> Result<(), LedgerError> {
        let id = peer.id().to_string();
        let mut peers = self.peers.lock().await;
        let existing = peers.contains_key(&id);

        if existing && policy == DuplicatePolicy::Reject {
            return Err(LedgerError::DuplicatePeer(id));
        }
        if let Some(capacity) = self.capacity {
            if !existing && peers.len() >= capacity {
                return Err(LedgerError::RegistryFull);
            }
        }

        insert(&mut peers, peer);
        Ok(())
    }

    /// Removes the entry for `id` if present.
    pub async fn unregister(&self, id: &str) -> Option<Arc<Peer>> {
        let mut peers = self.peers.lock().await;
        peers.remove(id)
    }

    /// Removes `peer` only if it is still the registered entry for its id, so
    /// a connection that was overwritten cannot evict its replacement.
    pub async fn unregister_peer(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get(peer.id()) {
            Some(current) if Arc::ptr_eq(current, peer) => peers.remove(peer.id()).is_some(),
            _ => false,
        }
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.lock().await;
        peers.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}

fn insert(peers: &mut HashMap<String, Arc<Peer>>, peer: Arc<Peer>) -> Option<Arc<Peer>> {
    let id = peer.id().to_string();
    let displaced = peers.insert(id.clone(), peer);
    if displaced.is_some() {
        warn!(peer = %id, "peer id re-registered; previous connection is no longer reachable");
    }
    displaced
}
