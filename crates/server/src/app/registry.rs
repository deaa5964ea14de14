use sotto_proto::ServerEnvelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::info;

pub struct ConnectionEntry {
    pub sender: mpsc::Sender<ServerEnvelope>,
    pub connection_id: u64,
    pub session_id: String,
}

/// Authoritative map from peer id to the live transport handle.
///
/// Delivery decisions consult this registry and never the presence store:
/// presence is an informational cache, the registry is the source of truth
/// inside the process. Nothing here is persisted; the map rebuilds itself
/// from client reconnections after a restart.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<i64, ConnectionEntry>>,
    next_connection: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport for a peer, evicting any prior entry without
    /// notifying it. Returns the handle the owning session presents to
    /// `unregister`, so a superseded session cannot remove its successor.
    pub async fn register(
        &self,
        peer: i64,
        sender: mpsc::Sender<ServerEnvelope>,
        session_id: String,
    ) -> u64 {
        let connection_id = self.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = ConnectionEntry {
            sender,
            connection_id,
            session_id,
        };
        let mut connections = self.connections.write().await;
        if let Some(previous) = connections.insert(peer, entry) {
            info!(peer, session = %previous.session_id, "superseded connection evicted");
        }
        connection_id
    }

    /// Removes the entry whose connection id matches and returns its peer id.
    /// A no-op returning `None` when a newer registration already replaced
    /// the entry.
    pub async fn unregister(&self, connection_id: u64) -> Option<i64> {
        let mut connections = self.connections.write().await;
        let peer = connections
            .iter()
            .find(|(_, entry)| entry.connection_id == connection_id)
            .map(|(peer, _)| *peer)?;
        connections.remove(&peer);
        Some(peer)
    }

    pub async fn lookup(&self, peer: i64) -> Option<mpsc::Sender<ServerEnvelope>> {
        let connections = self.connections.read().await;
        connections.get(&peer).map(|entry| entry.sender.clone())
    }

    /// Copy-on-read snapshot for iteration, safe under concurrent mutation.
    pub async fn snapshot(&self) -> Vec<(i64, mpsc::Sender<ServerEnvelope>)> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .map(|(peer, entry)| (*peer, entry.sender.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
