//! Directory of connected peers plus the event bus the engine components communicate over.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, RwLock},
};

use replica_core::{BlobId, PeerId};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::collaborators::RemotePeer;

/// Structured log line describing replication progress for a blob at a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub component: &'static str,
    pub peer: PeerId,
    pub phase: &'static str,
    pub blob: BlobId,
}

impl LogRecord {
    pub fn new(component: &'static str, peer: PeerId, phase: &'static str, blob: BlobId) -> Self {
        Self {
            component,
            peer,
            phase,
            blob,
        }
    }
}

/// Control events published on the registry bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    /// The process is shutting down.
    Close,
}

/// Connected peers, the process wide control bus and the progress log.
///
/// Progress records go out on their own channel so a burst of them cannot push connection
/// events out of a slow subscriber's buffer. Clones share the same directory and channels.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<BTreeMap<PeerId, Arc<dyn RemotePeer>>>>,
    events: broadcast::Sender<RegistryEvent>,
    logs: broadcast::Sender<LogRecord>,
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("connected", &self.connected())
            .finish()
    }
}

impl PeerRegistry {
    /// Create a registry whose channels buffer up to `capacity` items per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (logs, _) = broadcast::channel(capacity.max(1));
        Self {
            peers: Default::default(),
            events,
            logs,
        }
    }

    /// Register a new connection and announce it.
    ///
    /// A reconnecting peer replaces its previous connection.
    pub fn connect(&self, peer: PeerId, rpc: Arc<dyn RemotePeer>) {
        self.peers
            .write()
            .expect("should be able to acquire lock")
            .insert(peer.clone(), rpc);
        debug!(%peer, "peer connected");
        self.publish(RegistryEvent::Connected(peer));
    }

    /// Remove a connection and announce it. Returns false if the peer was not connected.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let removed = self
            .peers
            .write()
            .expect("should be able to acquire lock")
            .remove(peer)
            .is_some();
        if removed {
            debug!(%peer, "peer disconnected");
            self.publish(RegistryEvent::Disconnected(peer.clone()));
        }
        removed
    }

    /// The RPC handle of a connected peer.
    pub fn get(&self, peer: &PeerId) -> Option<Arc<dyn RemotePeer>> {
        self.peers
            .read()
            .expect("should be able to acquire lock")
            .get(peer)
            .cloned()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers
            .read()
            .expect("should be able to acquire lock")
            .contains_key(peer)
    }

    /// Ids of all connected peers.
    pub fn connected(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .expect("should be able to acquire lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Receive every control event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Receive every progress record published after this call.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogRecord> {
        self.logs.subscribe()
    }

    /// Emit a progress record to the tracing log and the progress channel.
    pub fn log(&self, record: LogRecord) {
        info!(
            component = record.component,
            peer = %record.peer,
            phase = record.phase,
            blob = %record.blob,
        );
        let _ = self.logs.send(record);
    }

    /// Announce shutdown to every subscriber.
    pub fn close(&self) {
        debug!("closing");
        self.publish(RegistryEvent::Close);
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is not an error, nobody is listening yet.
        let _ = self.events.send(event);
    }
}

/// Resolves once the bus announces shutdown or goes away.
pub(crate) async fn closed(events: &mut broadcast::Receiver<RegistryEvent>) {
    loop {
        match events.recv().await {
            Ok(RegistryEvent::Close) | Err(RecvError::Closed) => return,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event bus lagged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPeer;
    use test_log::test;

    #[test(tokio::test)]
    async fn connect_and_disconnect_are_announced() {
        let registry = PeerRegistry::new(16);
        let mut events = registry.subscribe();
        let peer = PeerId::from("@a");

        registry.connect(peer.clone(), Arc::new(MemoryPeer::new()));
        assert!(registry.is_connected(&peer));
        assert_eq!(vec![peer.clone()], registry.connected());
        assert!(registry.get(&peer).is_some());

        assert!(registry.disconnect(&peer));
        assert!(!registry.disconnect(&peer));
        assert!(registry.get(&peer).is_none());

        registry.close();
        assert_eq!(
            RegistryEvent::Connected(peer.clone()),
            events.recv().await.unwrap()
        );
        assert_eq!(
            RegistryEvent::Disconnected(peer),
            events.recv().await.unwrap()
        );
        assert_eq!(RegistryEvent::Close, events.recv().await.unwrap());
    }

    #[test(tokio::test)]
    async fn log_records_stay_off_the_control_bus() {
        let registry = PeerRegistry::new(16);
        let mut events = registry.subscribe();
        let mut logs = registry.subscribe_logs();
        let record = LogRecord::new(
            "blobs",
            PeerId::from("@a"),
            "found",
            BlobId::for_bytes(b"hello"),
        );
        for _ in 0..100 {
            registry.log(record.clone());
        }
        registry.connect(PeerId::from("@b"), Arc::new(MemoryPeer::new()));

        assert_eq!(
            RegistryEvent::Connected(PeerId::from("@b")),
            events.recv().await.unwrap()
        );
        // The progress channel lagged, the control bus did not.
        assert!(matches!(logs.recv().await, Err(RecvError::Lagged(84))));
        assert_eq!(record, logs.recv().await.unwrap());
    }
}
