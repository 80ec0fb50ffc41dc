//! Replication of content addressed blobs between peers.
//!
//! The [`LinkMonitor`] watches the feed for links to blobs and queues them on the [`WantList`].
//! When a peer connects the [`ConnectionHandler`] asks the [`QueryCoordinator`] to find out which
//! wanted blobs the peer has, and follows the blobs the peer acquires while connected. Blobs
//! found somewhere are fetched by the download [`Job`], at most a few at a time.
//!
//! [`Replicator`] wires all of it together.
#![warn(missing_debug_implementations, clippy::all)]

mod collaborators;
mod config;
mod connection;
pub mod download;
mod error;
mod link_monitor;
pub mod memory;
mod metrics;
mod query;
mod registry;
mod replicator;
mod scheduler;
mod want_list;


pub use collaborators::{
    BlobIdStream, BlobStore, ByteStream, Feed, Link, LinkStream, Message, RemotePeer,
};
pub use config::{Config, MAX_NOTFOUNDS};
pub use connection::ConnectionHandler;
pub use error::Error;
pub use link_monitor::LinkMonitor;
pub use metrics::{IgnoreReason, Metrics};
pub use query::QueryCoordinator;
pub use registry::{LogRecord, PeerRegistry, RegistryEvent};
pub use replicator::Replicator;
pub use scheduler::{Completion, Job};
pub use want_list::{WantList, WantSnapshot, WantState};

/// Result of replication operations
pub type Result<T> = std::result::Result<T, Error>;
