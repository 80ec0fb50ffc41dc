use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::StreamExt;
use replica_core::PeerId;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::AbortHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    collaborators::BlobIdStream,
    query::QueryCoordinator,
    registry::{PeerRegistry, RegistryEvent},
    scheduler::Job,
    want_list::WantList,
};

/// Reacts to peers connecting: forgets what they did not have, queries them and follows the
/// blobs they acquire while connected.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    want_list: WantList,
    registry: PeerRegistry,
    query: QueryCoordinator,
    download: Job,
    subscriptions: Arc<Mutex<HashMap<PeerId, AbortHandle>>>,
}

impl ConnectionHandler {
    pub fn new(
        want_list: WantList,
        registry: PeerRegistry,
        query: QueryCoordinator,
        download: Job,
    ) -> Self {
        Self {
            want_list,
            registry,
            query,
            download,
            subscriptions: Default::default(),
        }
    }

    /// Handle registry events until the registry closes.
    pub async fn run(self, mut events: broadcast::Receiver<RegistryEvent>) {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::Connected(peer)) => self.on_connect(peer),
                Ok(RegistryEvent::Disconnected(peer)) => self.on_disconnect(&peer),
                Ok(RegistryEvent::Close) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection handler lagged behind the event bus");
                    self.resync();
                }
            }
        }
        self.close();
    }

    /// Start replicating with a newly connected peer.
    pub fn on_connect(&self, peer: PeerId) {
        // The peer may have acquired blobs since it last said it did not have them.
        let cleared = self.want_list.clear_not_found(&peer);
        debug!(%peer, cleared, "peer connected");

        let query = self.query.clone();
        let queried = peer.clone();
        tokio::spawn(async move {
            if let Err(err) = query.query(&queried).await {
                warn!(peer = %queried, %err, "query failed");
            }
        });

        let Some(rpc) = self.registry.get(&peer) else {
            trace!(%peer, "gone before subscribing to changes");
            return;
        };
        let task = tokio::spawn(follow_changes(
            self.want_list.clone(),
            self.download.clone(),
            peer.clone(),
            rpc.changes(),
        ));
        let previous = self
            .subscriptions
            .lock()
            .expect("should be able to acquire lock")
            .insert(peer, task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop following a departed peer.
    pub fn on_disconnect(&self, peer: &PeerId) {
        let subscription = self
            .subscriptions
            .lock()
            .expect("should be able to acquire lock")
            .remove(peer);
        if let Some(subscription) = subscription {
            subscription.abort();
        }
        debug!(%peer, "peer disconnected");
    }

    /// Catch up with the registry after missing events: start replicating with connected peers
    /// that are not followed yet and stop following peers that are gone.
    pub fn resync(&self) {
        let connected = self.registry.connected();
        let (missed, departed) = {
            let subscriptions = self
                .subscriptions
                .lock()
                .expect("should be able to acquire lock");
            let missed: Vec<PeerId> = connected
                .iter()
                .filter(|peer| !subscriptions.contains_key(*peer))
                .cloned()
                .collect();
            let departed: Vec<PeerId> = subscriptions
                .keys()
                .filter(|peer| !connected.contains(peer))
                .cloned()
                .collect();
            (missed, departed)
        };
        debug!(
            missed = missed.len(),
            departed = departed.len(),
            "resyncing with registry"
        );
        for peer in departed {
            self.on_disconnect(&peer);
        }
        for peer in missed {
            self.on_connect(peer);
        }
    }

    fn close(&self) {
        debug!("connection handler closing");
        self.download.shutdown();
        for (_, subscription) in self
            .subscriptions
            .lock()
            .expect("should be able to acquire lock")
            .drain()
        {
            subscription.abort();
        }
    }
}

/// Mark blobs the peer announces as found there and kick the download job.
///
/// Ends silently on the first error, peers without the capability fail right away.
async fn follow_changes(
    want_list: WantList,
    download: Job,
    peer: PeerId,
    mut changes: BlobIdStream,
) {
    while let Some(Ok(id)) = changes.next().await {
        if want_list.wants(&id) {
            trace!(%peer, blob = %id, "peer announced wanted blob");
            want_list.set_found_at(&id, &peer);
            download.trigger();
        }
    }
    trace!(%peer, "changes subscription ended");
}
