//! In memory implementations of the collaborator traits, for tests and local simulation.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{future, stream, StreamExt, TryStreamExt};
use replica_core::{BlobId, MessageKey};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};

use crate::collaborators::{
    BlobIdStream, BlobStore, ByteStream, Feed, Link, LinkStream, Message, RemotePeer,
};

/// Blob store keeping content in a map keyed by desigiled hash.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store content directly, returning its id.
    pub fn insert(&self, data: impl Into<Bytes>) -> BlobId {
        let data = data.into();
        let id = BlobId::for_bytes(&data);
        self.blobs
            .lock()
            .expect("should be able to acquire lock")
            .insert(id.desigiled().to_owned(), data);
        id
    }

    pub fn get(&self, id: &BlobId) -> Option<Bytes> {
        self.blobs
            .lock()
            .expect("should be able to acquire lock")
            .get(id.desigiled())
            .cloned()
    }

    pub fn contains(&self, id: &BlobId) -> bool {
        self.blobs
            .lock()
            .expect("should be able to acquire lock")
            .contains_key(id.desigiled())
    }

    pub fn len(&self) -> usize {
        self.blobs
            .lock()
            .expect("should be able to acquire lock")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn has(&self, id: &BlobId) -> Result<bool> {
        Ok(self.contains(id))
    }

    async fn add(&self, key: &str, content: ByteStream) -> Result<String> {
        let data = content
            .try_fold(BytesMut::new(), |mut acc, chunk| {
                acc.extend_from_slice(&chunk);
                future::ready(Ok(acc))
            })
            .await?
            .freeze();
        let id = BlobId::for_bytes(&data);
        if id.desigiled() != key {
            bail!(
                "hash mismatch, expected {key} but content hashes to {}",
                id.desigiled()
            );
        }
        self.blobs
            .lock()
            .expect("should be able to acquire lock")
            .insert(key.to_owned(), data);
        Ok(id.desigiled().to_owned())
    }
}

/// Feed where messages are appended by hand and broadcast to every live link stream.
#[derive(Debug, Default)]
pub struct MemoryFeed {
    messages: Mutex<HashMap<MessageKey, Message>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Link>>>,
    seq: AtomicU64,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message created at `timestamp_ms` that links to `dest`.
    pub fn publish(&self, dest: impl Into<String>, timestamp_ms: i64) -> MessageKey {
        let key = MessageKey::new(format!("%msg-{}", self.seq.fetch_add(1, Ordering::Relaxed)));
        self.messages
            .lock()
            .expect("should be able to acquire lock")
            .insert(
                key.clone(),
                Message {
                    key: key.clone(),
                    timestamp_ms,
                },
            );
        let link = Link {
            dest: dest.into(),
            source: key.clone(),
        };
        self.subscribers
            .lock()
            .expect("should be able to acquire lock")
            .retain(|tx| tx.send(link.clone()).is_ok());
        key
    }

    /// Emit a link whose source message cannot be found.
    pub fn publish_dangling(&self, dest: impl Into<String>) -> MessageKey {
        let key = MessageKey::new(format!(
            "%dangling-{}",
            self.seq.fetch_add(1, Ordering::Relaxed)
        ));
        let link = Link {
            dest: dest.into(),
            source: key.clone(),
        };
        self.subscribers
            .lock()
            .expect("should be able to acquire lock")
            .retain(|tx| tx.send(link.clone()).is_ok());
        key
    }
}

#[async_trait]
impl Feed for MemoryFeed {
    fn links(&self) -> LinkStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("should be able to acquire lock")
            .push(tx);
        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn get(&self, key: &MessageKey) -> Result<Message> {
        self.messages
            .lock()
            .expect("should be able to acquire lock")
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("message {key} not found"))
    }
}

/// A simulated remote peer serving blobs from its own store.
#[derive(Debug)]
pub struct MemoryPeer {
    store: MemoryBlobStore,
    changes: Mutex<Option<broadcast::Sender<BlobId>>>,
    fail_queries: AtomicBool,
    fail_transfers: AtomicBool,
    query_gate: Mutex<Option<Arc<Semaphore>>>,
    queries: AtomicUsize,
    queries_in_flight: AtomicUsize,
    peak_queries_in_flight: AtomicUsize,
    transfers: AtomicUsize,
}

impl Default for MemoryPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPeer {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self::with_changes(Some(changes))
    }

    /// A peer that does not support change subscriptions.
    pub fn without_changes() -> Self {
        Self::with_changes(None)
    }

    fn with_changes(changes: Option<broadcast::Sender<BlobId>>) -> Self {
        Self {
            store: MemoryBlobStore::new(),
            changes: Mutex::new(changes),
            fail_queries: AtomicBool::new(false),
            fail_transfers: AtomicBool::new(false),
            query_gate: Mutex::new(None),
            queries: AtomicUsize::new(0),
            queries_in_flight: AtomicUsize::new(0),
            peak_queries_in_flight: AtomicUsize::new(0),
            transfers: AtomicUsize::new(0),
        }
    }

    /// Give the peer a blob and notify change subscribers.
    pub fn acquire(&self, data: impl Into<Bytes>) -> BlobId {
        let id = self.store.insert(data);
        if let Some(changes) = self
            .changes
            .lock()
            .expect("should be able to acquire lock")
            .as_ref()
        {
            // No subscribers is fine.
            let _ = changes.send(id.clone());
        }
        id
    }

    pub fn store(&self) -> &MemoryBlobStore {
        &self.store
    }

    /// Make `has` calls fail.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make `get` streams fail.
    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Hold every `has` call until a permit is added to the returned semaphore.
    pub fn hold_queries(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self
            .query_gate
            .lock()
            .expect("should be able to acquire lock") = Some(gate.clone());
        gate
    }

    /// End all change subscriptions, as a dropped connection would.
    pub fn close(&self) {
        self.changes
            .lock()
            .expect("should be able to acquire lock")
            .take();
    }

    /// Number of live change subscriptions.
    pub fn subscribers(&self) -> usize {
        self.changes
            .lock()
            .expect("should be able to acquire lock")
            .as_ref()
            .map_or(0, |changes| changes.receiver_count())
    }

    /// Number of `has` calls received.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `has` calls currently being answered.
    pub fn queries_in_flight(&self) -> usize {
        self.queries_in_flight.load(Ordering::SeqCst)
    }

    /// Largest number of `has` calls that were answered at the same time.
    pub fn peak_queries_in_flight(&self) -> usize {
        self.peak_queries_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `get` calls received.
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemotePeer for MemoryPeer {
    async fn has(&self, ids: &[BlobId]) -> Result<Vec<bool>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let now = self.queries_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_queries_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self
            .query_gate
            .lock()
            .expect("should be able to acquire lock")
            .clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire_owned().await {
                permit.forget();
            }
        }

        self.queries_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            bail!("connection reset");
        }
        Ok(ids.iter().map(|id| self.store.contains(id)).collect())
    }

    fn get(&self, id: &BlobId) -> ByteStream {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        if self.fail_transfers.load(Ordering::SeqCst) {
            return stream::once(future::ready(Err(anyhow!("stream closed")))).boxed();
        }
        match self.store.get(id) {
            Some(data) => stream::iter(
                data.chunks(1024)
                    .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                    .collect::<Vec<_>>(),
            )
            .boxed(),
            None => {
                let err = anyhow!("blob {id} not found");
                stream::once(future::ready(Err(err))).boxed()
            }
        }
    }

    fn changes(&self) -> BlobIdStream {
        match self
            .changes
            .lock()
            .expect("should be able to acquire lock")
            .as_ref()
        {
            Some(changes) => BroadcastStream::new(changes.subscribe())
                // Lagging subscribers miss notifications, they are only hints.
                .filter_map(|change| future::ready(change.ok().map(Ok)))
                .boxed(),
            None => stream::once(future::ready(Err(anyhow!(
                "no such method: blobs.changes"
            ))))
            .boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn store_verifies_content_hash() {
        let store = MemoryBlobStore::new();
        let id = BlobId::for_bytes(b"hello");
        let content = stream::iter(vec![
            Ok(Bytes::from_static(b"hel")),
            Ok(Bytes::from_static(b"lo")),
        ]);
        let written = store.add(id.desigiled(), content.boxed()).await.unwrap();
        assert_eq!(id.desigiled(), written);
        assert!(store.has(&id).await.unwrap());

        let other = BlobId::for_bytes(b"world");
        let content = stream::iter(vec![Ok(Bytes::from_static(b"hello"))]);
        let err = store
            .add(other.desigiled(), content.boxed())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hash mismatch"), "{err}");
        assert!(!store.contains(&other));
    }

    #[test(tokio::test)]
    async fn peer_serves_its_blobs() {
        let peer = MemoryPeer::new();
        let id = peer.acquire(vec![7u8; 4000]);
        let missing = BlobId::for_bytes(b"missing");
        assert_eq!(
            vec![true, false],
            peer.has(&[id.clone(), missing.clone()]).await.unwrap()
        );
        let chunks: Vec<Bytes> = peer.get(&id).try_collect().await.unwrap();
        assert_eq!(4, chunks.len());
        assert!(peer.get(&missing).try_collect::<Vec<_>>().await.is_err());
        assert_eq!(2, peer.transfers());
    }

    #[test(tokio::test)]
    async fn changes_end_when_closed() {
        let peer = MemoryPeer::new();
        let mut changes = peer.changes();
        let id = peer.acquire("new");
        assert_eq!(id, changes.next().await.unwrap().unwrap());
        peer.close();
        assert!(changes.next().await.is_none());

        let mut unsupported = MemoryPeer::without_changes().changes();
        assert!(unsupported.next().await.unwrap().is_err());
    }

    #[test(tokio::test)]
    async fn feed_broadcasts_links() {
        let feed = MemoryFeed::new();
        let mut links = feed.links();
        let key = feed.publish("&dest", 42);
        let link = links.next().await.unwrap();
        assert_eq!("&dest", link.dest);
        assert_eq!(key, link.source);
        assert_eq!(42, feed.get(&key).await.unwrap().timestamp_ms);
        let dangling = feed.publish_dangling("&dest");
        assert!(feed.get(&dangling).await.is_err());
    }
}
