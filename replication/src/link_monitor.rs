use std::{fmt, sync::Arc, time::Duration};

use futures::StreamExt;
use replica_core::BlobId;
use replica_metrics::Recorder;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    collaborators::{BlobStore, Feed, Link, LinkStream},
    metrics::{IgnoreReason, LinkEvent, Metrics},
    query::QueryCoordinator,
    registry::{self, RegistryEvent},
    want_list::WantList,
    Error,
};

/// Watches the feed for links to blobs and queues the ones worth fetching.
///
/// A link is queued when it references a blob that is not stored locally and the message
/// containing it claims to be no further than `max_link_age` from now, in either direction.
/// Connected peers are then asked about the newly wanted blob.
pub struct LinkMonitor<S: ?Sized, F: ?Sized> {
    store: Arc<S>,
    feed: Arc<F>,
    want_list: WantList,
    query: QueryCoordinator,
    max_link_age: Duration,
    metrics: Metrics,
}

impl<S: ?Sized, F: ?Sized> fmt::Debug for LinkMonitor<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkMonitor")
            .field("max_link_age", &self.max_link_age)
            .finish_non_exhaustive()
    }
}

impl<S, F> LinkMonitor<S, F>
where
    S: BlobStore + ?Sized,
    F: Feed + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        feed: Arc<F>,
        want_list: WantList,
        query: QueryCoordinator,
        max_link_age: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            feed,
            want_list,
            query,
            max_link_age,
            metrics,
        }
    }

    /// Process links until the stream ends or the registry closes.
    ///
    /// Links are handled concurrently, a slow lookup does not hold back the next link.
    pub async fn run(self, links: LinkStream, mut events: broadcast::Receiver<RegistryEvent>) {
        let monitor = &self;
        let process = links.for_each_concurrent(None, |link| async move {
            monitor.handle(link).await;
        });
        tokio::select! {
            _ = process => debug!("link stream ended"),
            _ = registry::closed(&mut events) => debug!("link monitor closing"),
        }
    }

    /// Decide on a single link. Returns true if it was newly queued.
    pub async fn handle(&self, link: Link) -> bool {
        self.metrics.record(&LinkEvent::Seen);
        let Ok(id) = BlobId::parse(&link.dest) else {
            return self.ignore(IgnoreReason::NotBlob);
        };

        match self.store.has(&id).await {
            Ok(true) => return self.ignore(IgnoreReason::Owned),
            Ok(false) => {}
            Err(err) => {
                let err = Error::new_store(err);
                warn!(blob = %id, %err, "blob lookup failed, assuming it is missing");
            }
        }

        let message = match self.feed.get(&link.source).await {
            Ok(message) => message,
            Err(err) => {
                let err = Error::new_feed(err);
                warn!(blob = %id, source = %link.source, %err, "cannot read linking message");
                return self.ignore(IgnoreReason::LookupFailed);
            }
        };
        if !self.is_recent(message.timestamp_ms) {
            debug!(blob = %id, source = %link.source, "ignoring stale link");
            return self.ignore(IgnoreReason::Stale);
        }

        let queued = self.want_list.queue(id);
        if queued {
            self.metrics.record(&LinkEvent::Queued);
            // Peers connected before the link was seen have not been asked about it.
            self.query.query_connected();
        }
        queued
    }

    fn is_recent(&self, timestamp_ms: i64) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        let distance = Duration::from_millis(now.abs_diff(timestamp_ms));
        distance < self.max_link_age
    }

    fn ignore(&self, reason: IgnoreReason) -> bool {
        self.metrics.record(&LinkEvent::Ignored(reason));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use prometheus_client::registry::Registry;
    use test_log::test;

    use crate::{
        config::Config,
        memory::{MemoryBlobStore, MemoryFeed},
        registry::PeerRegistry,
        scheduler::{Completion, Job},
        tests::MockStore,
    };

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn monitor<S: BlobStore>(
        store: S,
        feed: Arc<MemoryFeed>,
    ) -> (LinkMonitor<S, MemoryFeed>, WantList) {
        let metrics = Metrics::register(&mut Registry::default());
        let want_list = WantList::default();
        let registry = PeerRegistry::new(16);
        let download = Job::new(
            "download",
            Duration::from_millis(300),
            5,
            metrics.clone(),
            || async { Completion::Done },
        );
        let query = QueryCoordinator::new(want_list.clone(), registry, download, metrics.clone());
        let monitor = LinkMonitor::new(
            Arc::new(store),
            feed,
            want_list.clone(),
            query,
            Config::default().max_link_age,
            metrics,
        );
        (monitor, want_list)
    }

    fn link(feed: &MemoryFeed, id: &BlobId, timestamp_ms: i64) -> Link {
        Link {
            dest: id.to_string(),
            source: feed.publish(id.to_string(), timestamp_ms),
        }
    }

    #[test(tokio::test)]
    async fn queues_recent_missing_blobs() {
        let feed = Arc::new(MemoryFeed::new());
        let (monitor, want_list) = monitor(MemoryBlobStore::new(), feed.clone());
        let id = BlobId::for_bytes(b"recent");
        assert!(monitor.handle(link(&feed, &id, now_ms())).await);
        assert!(want_list.wants(&id));
        // Seeing the same blob again does not queue it twice.
        assert!(!monitor.handle(link(&feed, &id, now_ms())).await);
        assert_eq!(1, want_list.len());
    }

    #[test(tokio::test)]
    async fn ignores_links_to_other_things() {
        let feed = Arc::new(MemoryFeed::new());
        let (monitor, want_list) = monitor(MemoryBlobStore::new(), feed.clone());
        let source = feed.publish("%not-a-blob.sha256", now_ms());
        let handled = monitor
            .handle(Link {
                dest: "%not-a-blob.sha256".to_owned(),
                source,
            })
            .await;
        assert!(!handled);
        assert!(want_list.is_empty());
    }

    #[test(tokio::test)]
    async fn ignores_owned_blobs() {
        let feed = Arc::new(MemoryFeed::new());
        let store = MemoryBlobStore::new();
        let id = store.insert("owned");
        let (monitor, want_list) = monitor(store, feed.clone());
        assert!(!monitor.handle(link(&feed, &id, now_ms())).await);
        assert!(want_list.is_empty());
    }

    #[test(tokio::test)]
    async fn staleness_applies_in_both_directions() {
        let feed = Arc::new(MemoryFeed::new());
        let (monitor, want_list) = monitor(MemoryBlobStore::new(), feed.clone());
        let cases = [
            ("29 days old", -29 * DAY_MS, true),
            ("29 days ahead", 29 * DAY_MS, true),
            ("31 days old", -31 * DAY_MS, false),
            ("31 days ahead", 31 * DAY_MS, false),
        ];
        for (name, offset, expected) in cases {
            let id = BlobId::for_bytes(name.as_bytes());
            let queued = monitor.handle(link(&feed, &id, now_ms() + offset)).await;
            assert_eq!(expected, queued, "{name}");
            assert_eq!(expected, want_list.wants(&id), "{name}");
        }
    }

    #[test(tokio::test)]
    async fn unreadable_message_is_ignored() {
        let feed = Arc::new(MemoryFeed::new());
        let (monitor, want_list) = monitor(MemoryBlobStore::new(), feed.clone());
        let id = BlobId::for_bytes(b"dangling");
        let source = feed.publish_dangling(id.to_string());
        assert!(
            !monitor
                .handle(Link {
                    dest: id.to_string(),
                    source,
                })
                .await
        );
        assert!(want_list.is_empty());
    }

    #[test(tokio::test)]
    async fn store_lookup_failure_is_treated_as_missing() {
        let mut store = MockStore::new();
        store
            .expect_has()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("disk on fire")));
        let feed = Arc::new(MemoryFeed::new());
        let (monitor, want_list) = monitor(store, feed.clone());
        let id = BlobId::for_bytes(b"unknown");
        assert!(monitor.handle(link(&feed, &id, now_ms())).await);
        assert!(want_list.wants(&id));
    }

    #[test(tokio::test)]
    async fn run_stops_on_close() {
        let feed = Arc::new(MemoryFeed::new());
        let registry = PeerRegistry::new(16);
        let (monitor, want_list) = monitor(MemoryBlobStore::new(), feed.clone());
        let links = feed.links();
        let task = tokio::spawn(monitor.run(links, registry.subscribe()));

        let id = BlobId::for_bytes(b"live");
        feed.publish(id.to_string(), now_ms());
        while !want_list.wants(&id) {
            tokio::task::yield_now().await;
        }
        registry.close();
        task.await.unwrap();
    }
}
