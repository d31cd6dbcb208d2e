//! Live connections and the chunks each one watches.
//!
//! Two mirrored indices are kept: connection → chunks and chunk → connections.
//! Both live behind one mutex and every mutation touches them inside the same
//! critical section, so they cannot drift apart. A connection's entries only
//! ever leave through [`SubscriptionRegistry::remove_connection`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tesserae_ipc::ChunkCoord;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Encoded frames queued for one connection
pub type Outbox = mpsc::Sender<Arc<str>>;

/// Receiving half of an [`Outbox`]
pub type OutboxReceiver = mpsc::Receiver<Arc<str>>;

/// Create a bounded outbox pair
pub fn outbox(capacity: usize) -> (Outbox, OutboxReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Identifies one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionEntry {
    outbox: Outbox,
    chunks: HashSet<ChunkCoord>,
}

#[derive(Default)]
struct Indices {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_chunk: HashMap<ChunkCoord, HashSet<ConnectionId>>,
}

/// Tracks which connections care about which chunks
#[derive(Default)]
pub struct SubscriptionRegistry {
    indices: Mutex<Indices>,
    next_id: AtomicU64,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("connections", &self.connection_count())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection with no subscriptions
    pub fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let total = {
            let mut indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
            indices.connections.insert(
                id,
                ConnectionEntry {
                    outbox,
                    chunks: HashSet::new(),
                },
            );
            indices.connections.len()
        };
        info!("Connection {} registered. Total connections: {}", id, total);
        id
    }

    /// Add chunks to a connection's interest set; returns how many were new
    ///
    /// Unknown connections are ignored.
    pub fn subscribe<I>(&self, id: ConnectionId, chunks: I) -> usize
    where
        I: IntoIterator<Item = ChunkCoord>,
    {
        let mut indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
        let Indices {
            connections,
            by_chunk,
        } = &mut *indices;
        let Some(entry) = connections.get_mut(&id) else {
            return 0;
        };

        let mut added = 0;
        for chunk in chunks {
            if entry.chunks.insert(chunk) {
                by_chunk.entry(chunk).or_default().insert(id);
                added += 1;
            }
        }
        debug!(
            "{} subscribed to {} new chunks. Total: {}",
            id,
            added,
            entry.chunks.len()
        );
        added
    }

    /// Remove chunks from a connection's interest set; returns how many were removed
    ///
    /// Chunks that were not subscribed are skipped.
    pub fn unsubscribe<I>(&self, id: ConnectionId, chunks: I) -> usize
    where
        I: IntoIterator<Item = ChunkCoord>,
    {
        let mut indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
        let Indices {
            connections,
            by_chunk,
        } = &mut *indices;
        let Some(entry) = connections.get_mut(&id) else {
            return 0;
        };

        let mut removed = 0;
        for chunk in chunks {
            if entry.chunks.remove(&chunk) {
                detach(by_chunk, chunk, id);
                removed += 1;
            }
        }
        debug!(
            "{} unsubscribed from {} chunks. Remaining: {}",
            id,
            removed,
            entry.chunks.len()
        );
        removed
    }

    /// Purge a connection from both indices; returns whether it was present
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
            let Indices {
                connections,
                by_chunk,
            } = &mut *indices;
            let removed = match connections.remove(&id) {
                Some(entry) => {
                    for chunk in entry.chunks {
                        detach(by_chunk, chunk, id);
                    }
                    true
                }
                None => false,
            };
            (removed, connections.len())
        };
        if removed {
            info!("Connection {} removed. Total connections: {}", id, total);
        }
        removed
    }

    /// Connections subscribed to a chunk
    pub fn subscribers_of(&self, chunk: ChunkCoord) -> HashSet<ConnectionId> {
        let indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
        indices.by_chunk.get(&chunk).cloned().unwrap_or_default()
    }

    /// Outboxes of the connections subscribed to a chunk
    pub fn outboxes_for(&self, chunk: ChunkCoord) -> Vec<(ConnectionId, Outbox)> {
        let indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
        let Some(ids) = indices.by_chunk.get(&chunk) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| {
                indices
                    .connections
                    .get(id)
                    .map(|entry| (*id, entry.outbox.clone()))
            })
            .collect()
    }

    /// Outbox of every live connection
    pub fn all_outboxes(&self) -> Vec<(ConnectionId, Outbox)> {
        let indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
        indices
            .connections
            .iter()
            .map(|(id, entry)| (*id, entry.outbox.clone()))
            .collect()
    }

    /// Outbox of one connection
    pub fn outbox_of(&self, id: ConnectionId) -> Option<Outbox> {
        let indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
        indices.connections.get(&id).map(|entry| entry.outbox.clone())
    }

    /// Chunks a connection is subscribed to
    pub fn subscriptions_of(&self, id: ConnectionId) -> HashSet<ChunkCoord> {
        let indices = self.indices.lock().expect("SubscriptionRegistry lock poisoned");
        indices
            .connections
            .get(&id)
            .map(|entry| entry.chunks.clone())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.indices
            .lock()
            .map(|indices| indices.connections.len())
            .unwrap_or(0)
    }

    /// Total (connection, chunk) pairs
    pub fn subscription_count(&self) -> usize {
        self.indices
            .lock()
            .map(|indices| indices.by_chunk.values().map(|ids| ids.len()).sum())
            .unwrap_or(0)
    }

    /// Chunks with at least one subscriber
    pub fn watched_chunk_count(&self) -> usize {
        self.indices
            .lock()
            .map(|indices| indices.by_chunk.len())
            .unwrap_or(0)
    }
}

fn detach(by_chunk: &mut HashMap<ChunkCoord, HashSet<ConnectionId>>, chunk: ChunkCoord, id: ConnectionId) {
    if let Some(ids) = by_chunk.get_mut(&chunk) {
        ids.remove(&id);
        if ids.is_empty() {
            by_chunk.remove(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(cx: u32, cy: u32) -> ChunkCoord {
        ChunkCoord::new(cx, cy)
    }

    fn connect(registry: &SubscriptionRegistry) -> (ConnectionId, OutboxReceiver) {
        let (tx, rx) = outbox(8);
        (registry.register(tx), rx)
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx) = connect(&registry);

        assert_eq!(registry.subscribe(a, [chunk(0, 0), chunk(1, 0)]), 2);
        assert_eq!(registry.subscribe(a, [chunk(0, 0)]), 0);
        assert_eq!(registry.subscription_count(), 2);
        assert_eq!(registry.subscribers_of(chunk(0, 0)), HashSet::from([a]));
    }

    #[test]
    fn test_reverse_lookup_distinguishes_connections() {
        let registry = SubscriptionRegistry::new();
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);

        registry.subscribe(a, [chunk(5, 3)]);
        registry.subscribe(b, [chunk(4, 3)]);

        assert_eq!(registry.subscribers_of(chunk(5, 3)), HashSet::from([a]));
        assert_eq!(registry.subscribers_of(chunk(4, 3)), HashSet::from([b]));
        assert!(registry.subscribers_of(chunk(0, 0)).is_empty());
        assert_eq!(registry.outboxes_for(chunk(5, 3)).len(), 1);
    }

    #[test]
    fn test_unsubscribe_missing_is_noop() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx) = connect(&registry);
        registry.subscribe(a, [chunk(1, 1)]);

        assert_eq!(registry.unsubscribe(a, [chunk(2, 2)]), 0);
        assert_eq!(registry.unsubscribe(a, [chunk(1, 1)]), 1);
        assert_eq!(registry.watched_chunk_count(), 0);
        assert!(registry.subscriptions_of(a).is_empty());
    }

    #[test]
    fn test_unknown_connection_ignored() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx) = connect(&registry);
        registry.remove_connection(a);
        assert_eq!(registry.subscribe(a, [chunk(0, 0)]), 0);
        assert_eq!(registry.watched_chunk_count(), 0);
        assert!(!registry.remove_connection(a));
    }

    #[test]
    fn test_disconnect_leaves_no_residue() {
        let registry = SubscriptionRegistry::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..50u32 {
            let (id, rx) = connect(&registry);
            registry.subscribe(id, (0..=i % 7).map(|c| chunk(c, i % 3)));
            ids.push(id);
            receivers.push(rx);
        }
        let (survivor, _rx) = connect(&registry);
        registry.subscribe(survivor, [chunk(0, 0)]);

        for id in &ids {
            assert!(registry.remove_connection(*id));
        }

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.watched_chunk_count(), 1);
        for c in [chunk(0, 0), chunk(3, 1), chunk(6, 2)] {
            let subscribers = registry.subscribers_of(c);
            assert!(ids.iter().all(|id| !subscribers.contains(id)));
        }
    }

    #[test]
    fn test_concurrent_churn_keeps_indices_consistent() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        let (tx, _rx) = outbox(1);
                        let id = registry.register(tx);
                        registry.subscribe(id, [chunk(t, i % 10), chunk(i % 10, t)]);
                        registry.unsubscribe(id, [chunk(t, i % 10)]);
                        registry.remove_connection(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(registry.watched_chunk_count(), 0);
    }
}
