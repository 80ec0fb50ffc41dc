//! Interfaces of the systems the replication engine drives: remote peers, the local blob store
//! and the feed that references blobs.
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use replica_core::{BlobId, MessageKey};

/// Content of a blob as it is streamed from a peer.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Live notifications of blobs a peer has acquired.
pub type BlobIdStream = BoxStream<'static, Result<BlobId>>;

/// Live links observed on the feed.
pub type LinkStream = BoxStream<'static, Link>;

/// The blob methods a connected peer exposes over RPC.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Ask which of the blobs the peer has. The answer is aligned by index with `ids`.
    async fn has(&self, ids: &[BlobId]) -> Result<Vec<bool>>;

    /// Stream the content of a blob from the peer.
    fn get(&self, id: &BlobId) -> ByteStream;

    /// Subscribe to blobs the peer acquires from now on.
    ///
    /// Peers without the capability produce an error or end the stream.
    fn changes(&self) -> BlobIdStream;
}

/// Content addressed local storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reports if the blob is stored locally.
    async fn has(&self, id: &BlobId) -> Result<bool>;

    /// Store the streamed content under `key`, a desigiled blob hash.
    ///
    /// Returns the desigiled hash of what was written. Fails if the content does not hash to `key`.
    async fn add(&self, key: &str, content: ByteStream) -> Result<String>;
}

/// A reference from a feed message to some destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// What the message links to, not necessarily a blob.
    pub dest: String,
    /// The message containing the link.
    pub source: MessageKey,
}

/// The parts of a feed message the engine reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Key of the message
    pub key: MessageKey,
    /// Claimed creation time, milliseconds since the UNIX epoch.
    pub timestamp_ms: i64,
}

/// The append only log messages are read from.
#[async_trait]
pub trait Feed: Send + Sync {
    /// Live stream of links, starting now. Not restartable.
    fn links(&self) -> LinkStream;

    /// Look up a message by key.
    async fn get(&self, key: &MessageKey) -> Result<Message>;
}

#[async_trait]
impl<S: BlobStore + ?Sized> BlobStore for Arc<S> {
    async fn has(&self, id: &BlobId) -> Result<bool> {
        self.as_ref().has(id).await
    }
    async fn add(&self, key: &str, content: ByteStream) -> Result<String> {
        self.as_ref().add(key, content).await
    }
}

#[async_trait]
impl<F: Feed + ?Sized> Feed for Arc<F> {
    fn links(&self) -> LinkStream {
        self.as_ref().links()
    }
    async fn get(&self, key: &MessageKey) -> Result<Message> {
        self.as_ref().get(key).await
    }
}
