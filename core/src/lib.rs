//! # Replica Core
//! Identifier types for the blob replication engine: blob references, peer ids and feed
//! message keys.
#![warn(missing_docs)]
mod blob_id;
mod key;
mod peer;

pub use blob_id::{desigil, is_blob_ref, resigil, BlobId, IdError, BLOB_SIGIL};
pub use key::MessageKey;
pub use peer::PeerId;
