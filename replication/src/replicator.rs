use std::sync::Arc;

use replica_core::{BlobId, PeerId};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    collaborators::{BlobStore, Feed},
    config::Config,
    connection::ConnectionHandler,
    download,
    link_monitor::LinkMonitor,
    metrics::Metrics,
    query::QueryCoordinator,
    registry::PeerRegistry,
    scheduler::Job,
    want_list::WantList,
    Result,
};

/// A running replication engine.
///
/// Owns the background tasks watching the feed and the registry. They stop when the registry
/// is closed, see [`Replicator::shutdown`].
#[derive(Debug)]
pub struct Replicator {
    want_list: WantList,
    registry: PeerRegistry,
    download: Job,
    query: QueryCoordinator,
    tasks: Vec<JoinHandle<()>>,
}

impl Replicator {
    /// Wire the components together and start watching the feed and the registry.
    ///
    /// Must be called within a tokio runtime.
    pub fn start<S, F>(
        config: &Config,
        registry: PeerRegistry,
        store: S,
        feed: F,
        metrics: Metrics,
    ) -> Self
    where
        S: BlobStore + 'static,
        F: Feed + 'static,
    {
        let want_list = WantList::new(config.max_notfounds);
        let store = Arc::new(store);
        let feed = Arc::new(feed);

        let download = download::job(
            config,
            want_list.clone(),
            registry.clone(),
            store.clone(),
            metrics.clone(),
        );
        let query = QueryCoordinator::new(
            want_list.clone(),
            registry.clone(),
            download.clone(),
            metrics.clone(),
        );
        let monitor = LinkMonitor::new(
            store,
            feed.clone(),
            want_list.clone(),
            query.clone(),
            config.max_link_age,
            metrics,
        );
        let handler = ConnectionHandler::new(
            want_list.clone(),
            registry.clone(),
            query.clone(),
            download.clone(),
        );

        // Subscribe before spawning so nothing published after start is missed.
        let links = feed.links();
        let monitor_events = registry.subscribe();
        let handler_events = registry.subscribe();
        let tasks = vec![
            tokio::spawn(monitor.run(links, monitor_events)),
            tokio::spawn(handler.run(handler_events)),
        ];
        debug!("replication started");

        Self {
            want_list,
            registry,
            download,
            query,
            tasks,
        }
    }

    pub fn want_list(&self) -> &WantList {
        &self.want_list
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Handle to the download job, triggering it is always safe.
    pub fn download(&self) -> &Job {
        &self.download
    }

    /// Query a single peer, see [`QueryCoordinator::query`].
    pub async fn query(&self, peer: &PeerId) -> Result<()> {
        self.query.query(peer).await
    }

    /// Want a blob regardless of the feed and ask every connected peer about it.
    ///
    /// Returns false if the blob was already wanted.
    pub fn want(&self, id: BlobId) -> bool {
        if !self.want_list.queue(id) {
            return false;
        }
        self.query.query_connected();
        true
    }

    /// Close the registry and wait for the background tasks to stop.
    ///
    /// Pending download retries are cancelled, transfers already running finish on their own.
    pub async fn shutdown(self) -> Result<()> {
        self.registry.close();
        self.download.shutdown();
        for task in self.tasks {
            task.await?;
        }
        debug!("replication stopped");
        Ok(())
    }
}
