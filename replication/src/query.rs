use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use futures::future;
use replica_core::{BlobId, PeerId};
use replica_metrics::Recorder;
use tracing::{debug, trace, warn};

use crate::{
    metrics::{Metrics, QueryEvent},
    registry::{LogRecord, PeerRegistry},
    scheduler::Job,
    want_list::{WantList, WantState},
    Error, Result,
};

/// Asks peers which of the waiting blobs they have, one batched query per peer at a time.
#[derive(Debug, Clone)]
pub struct QueryCoordinator {
    want_list: WantList,
    registry: PeerRegistry,
    download: Job,
    in_flight: Arc<Mutex<HashSet<PeerId>>>,
    metrics: Metrics,
}

impl QueryCoordinator {
    pub fn new(
        want_list: WantList,
        registry: PeerRegistry,
        download: Job,
        metrics: Metrics,
    ) -> Self {
        Self {
            want_list,
            registry,
            download,
            in_flight: Default::default(),
            metrics,
        }
    }

    /// Reports if a query to the peer is awaiting its answer.
    pub fn is_querying(&self, peer: &PeerId) -> bool {
        self.in_flight
            .lock()
            .expect("should be able to acquire lock")
            .contains(peer)
    }

    /// Query every connected peer in the background, logging failures.
    pub fn query_connected(&self) {
        for peer in self.registry.connected() {
            let coordinator = self.clone();
            tokio::spawn(async move {
                if let Err(err) = coordinator.query(&peer).await {
                    warn!(%peer, %err, "query failed");
                }
            });
        }
    }

    /// Query the peer for every waiting blob it is not already known to have.
    ///
    /// Does nothing if the peer is not connected, already being queried or there is nothing to
    /// ask. Blobs the peer has are marked as found there and the download job is triggered. The
    /// returned future resolves once every blob found at the peer is no longer wanted.
    pub async fn query(&self, peer: &PeerId) -> Result<()> {
        let Some(rpc) = self.registry.get(peer) else {
            trace!(%peer, "not connected, skipping query");
            return Ok(());
        };
        let Some(in_flight) = InFlight::start(&self.in_flight, peer) else {
            trace!(%peer, "query already in flight");
            return Ok(());
        };

        let candidates: Vec<BlobId> = self
            .want_list
            .subset(|entry| {
                entry.state == WantState::Waiting && entry.has.get(peer) != Some(&true)
            })
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        debug!(%peer, count = candidates.len(), "querying");
        let answer = rpc.has(&candidates).await;
        drop(in_flight);
        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                self.metrics.record(&QueryEvent::Failed);
                return Err(Error::new_transport(peer.clone(), err).context("blobs.has"));
            }
        };

        let mut found = 0;
        let mut not_found = 0;
        let mut satisfied = Vec::new();
        for (id, has) in candidates.iter().zip(answer) {
            // Got while the query was in flight
            if !self.want_list.wants(id) {
                continue;
            }
            if has {
                found += 1;
                self.want_list.set_found_at(id, peer);
                satisfied.push(self.want_list.wait_for(id));
                self.registry
                    .log(LogRecord::new("blobs", peer.clone(), "found", id.clone()));
                self.download.trigger();
            } else if self.want_list.is_found_at(id, peer) {
                // Announced by the peer while the query was in flight, the answer is older.
                trace!(%peer, blob = %id, "ignoring outdated negative answer");
            } else {
                not_found += 1;
                self.want_list.record_not_found(id, peer);
            }
        }
        self.metrics
            .record(&QueryEvent::Answered { found, not_found });

        future::join_all(satisfied).await;
        Ok(())
    }
}

/// Marks a peer as being queried for as long as it lives.
struct InFlight<'a> {
    peers: &'a Mutex<HashSet<PeerId>>,
    peer: PeerId,
}

impl<'a> InFlight<'a> {
    fn start(peers: &'a Mutex<HashSet<PeerId>>, peer: &PeerId) -> Option<Self> {
        peers
            .lock()
            .expect("should be able to acquire lock")
            .insert(peer.clone())
            .then(|| Self {
                peers,
                peer: peer.clone(),
            })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.peers
            .lock()
            .expect("should be able to acquire lock")
            .remove(&self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use prometheus_client::registry::Registry;
    use test_log::test;

    use crate::{memory::MemoryPeer, scheduler::Completion};

    struct Fixture {
        want_list: WantList,
        registry: PeerRegistry,
        coordinator: QueryCoordinator,
    }

    fn fixture() -> Fixture {
        let metrics = Metrics::register(&mut Registry::default());
        let want_list = WantList::default();
        let registry = PeerRegistry::new(64);
        let download = Job::new(
            "download",
            Duration::from_millis(300),
            5,
            metrics.clone(),
            || async { Completion::Done },
        );
        let coordinator =
            QueryCoordinator::new(want_list.clone(), registry.clone(), download, metrics);
        Fixture {
            want_list,
            registry,
            coordinator,
        }
    }

    #[test(tokio::test)]
    async fn records_answers() {
        let f = fixture();
        let peer_id = PeerId::from("@a");
        let peer = Arc::new(MemoryPeer::new());
        let have = peer.acquire("have");
        let missing = BlobId::for_bytes(b"missing");
        f.want_list.queue(have.clone());
        f.want_list.queue(missing.clone());
        f.registry.connect(peer_id.clone(), peer.clone());

        let query = tokio::spawn({
            let coordinator = f.coordinator.clone();
            let peer_id = peer_id.clone();
            async move { coordinator.query(&peer_id).await }
        });
        // The query waits for the found blob to be satisfied.
        while !f.want_list.is_found_at(&have, &peer_id) {
            tokio::task::yield_now().await;
        }
        assert!(!f.coordinator.is_querying(&peer_id));
        assert_eq!(Some(1), f.want_list.notfounds(&missing));
        assert_eq!(
            Some(&false),
            f.want_list.get(&missing).unwrap().has.get(&peer_id)
        );
        assert_eq!(WantState::Ready, f.want_list.get(&have).unwrap().state);

        f.want_list.got(&have);
        query.await.unwrap().unwrap();
        assert_eq!(1, peer.queries());
    }

    #[test(tokio::test)]
    async fn skips_disconnected_and_known_peers() {
        let f = fixture();
        let peer_id = PeerId::from("@a");
        let peer = Arc::new(MemoryPeer::new());
        let id = BlobId::for_bytes(b"wanted");
        f.want_list.queue(id.clone());

        // Not connected
        f.coordinator.query(&peer_id).await.unwrap();
        assert_eq!(0, peer.queries());

        // Nothing to ask, the only waiting blob is already found at the peer.
        f.registry.connect(peer_id.clone(), peer.clone());
        f.want_list.set_found_at(&id, &peer_id);
        f.coordinator.query(&peer_id).await.unwrap();
        assert_eq!(0, peer.queries());
    }

    #[test(tokio::test)]
    async fn at_most_one_query_per_peer() {
        let f = fixture();
        let peer_id = PeerId::from("@a");
        let peer = Arc::new(MemoryPeer::new());
        let gate = peer.hold_queries();
        f.want_list.queue(BlobId::for_bytes(b"wanted"));
        f.registry.connect(peer_id.clone(), peer.clone());

        let first = tokio::spawn({
            let coordinator = f.coordinator.clone();
            let peer_id = peer_id.clone();
            async move { coordinator.query(&peer_id).await }
        });
        while peer.queries_in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(f.coordinator.is_querying(&peer_id));
        for _ in 0..10 {
            f.coordinator.query(&peer_id).await.unwrap();
        }
        assert_eq!(1, peer.queries());

        gate.add_permits(1);
        first.await.unwrap().unwrap();
        assert!(!f.coordinator.is_querying(&peer_id));
        assert_eq!(1, peer.peak_queries_in_flight());
    }

    #[test(tokio::test)]
    async fn transport_error_clears_in_flight_marker() {
        let f = fixture();
        let peer_id = PeerId::from("@a");
        let peer = Arc::new(MemoryPeer::new());
        peer.fail_queries(true);
        let id = BlobId::for_bytes(b"wanted");
        f.want_list.queue(id.clone());
        f.registry.connect(peer_id.clone(), peer.clone());

        let err = f.coordinator.query(&peer_id).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "{err}");
        assert!(!f.coordinator.is_querying(&peer_id));
        assert_eq!(Some(0), f.want_list.notfounds(&id));

        peer.fail_queries(false);
        f.coordinator.query(&peer_id).await.unwrap();
        assert_eq!(2, peer.queries());
        assert_eq!(Some(1), f.want_list.notfounds(&id));
    }

    #[test(tokio::test)]
    async fn blobs_got_during_query_are_left_alone() {
        let f = fixture();
        let peer_id = PeerId::from("@a");
        let peer = Arc::new(MemoryPeer::new());
        let gate = peer.hold_queries();
        let id = BlobId::for_bytes(b"raced");
        f.want_list.queue(id.clone());
        f.registry.connect(peer_id.clone(), peer.clone());

        let query = tokio::spawn({
            let coordinator = f.coordinator.clone();
            let peer_id = peer_id.clone();
            async move { coordinator.query(&peer_id).await }
        });
        while peer.queries_in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        f.want_list.got(&id);
        gate.add_permits(1);
        query.await.unwrap().unwrap();
        assert!(!f.want_list.wants(&id));
    }

    #[test(tokio::test)]
    async fn announcement_during_query_outranks_negative_answer() {
        let f = fixture();
        let peer_id = PeerId::from("@a");
        let peer = Arc::new(MemoryPeer::new());
        let gate = peer.hold_queries();
        let id = BlobId::for_bytes(b"announced");
        f.want_list.queue(id.clone());
        f.registry.connect(peer_id.clone(), peer.clone());

        let query = tokio::spawn({
            let coordinator = f.coordinator.clone();
            let peer_id = peer_id.clone();
            async move { coordinator.query(&peer_id).await }
        });
        while peer.queries_in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        // The answer was decided before the peer's announcement arrived.
        f.want_list.set_found_at(&id, &peer_id);
        gate.add_permits(1);
        query.await.unwrap().unwrap();

        let entry = f.want_list.get(&id).unwrap();
        assert_eq!(WantState::Ready, entry.state);
        assert_eq!(Some(&true), entry.has.get(&peer_id));
        assert_eq!(0, entry.notfounds);
    }
}
