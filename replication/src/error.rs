use replica_core::{BlobId, PeerId};

#[derive(Debug, thiserror::Error)]
/// The errors that can be raised while replicating blobs.
///
/// None of these are fatal to the engine, every failure leaves the want-list in a state from
/// which a later attempt can make progress.
pub enum Error {
    #[error("Transport error talking to {peer}: {error}")]
    /// A call to a remote peer failed or its stream broke.
    Transport {
        /// The remote peer
        peer: PeerId,
        /// The error details that may include context and other information
        error: anyhow::Error,
    },
    #[error("Blob store error: {error}")]
    /// The blob store could not check or write content, including hash verification failures.
    Store {
        /// The error details that may include context and other information
        error: anyhow::Error,
    },
    #[error("Feed error: {error}")]
    /// The feed could not resolve a message.
    Feed {
        /// The error details that may include context and other information
        error: anyhow::Error,
    },
    #[error("Blob {blob} cannot move from {from} to {to}")]
    /// A want-list transition was requested from the wrong state, usually because of a race.
    InvalidState {
        /// The blob being transitioned
        blob: BlobId,
        /// The current state, or `untracked`
        from: &'static str,
        /// The requested state
        to: &'static str,
    },
    #[error("Worker died: {error}")]
    /// A background task went away, usually the result of a channel being closed unexpectedly.
    WorkerDied {
        /// The error details that may include context and other information
        error: anyhow::Error,
    },
}

impl Error {
    /// Create a transport error
    pub fn new_transport(peer: PeerId, error: impl Into<anyhow::Error>) -> Self {
        Self::Transport {
            peer,
            error: error.into(),
        }
    }
    /// Create a store error
    pub fn new_store(error: impl Into<anyhow::Error>) -> Self {
        Self::Store {
            error: error.into(),
        }
    }
    /// Create a feed error
    pub fn new_feed(error: impl Into<anyhow::Error>) -> Self {
        Self::Feed {
            error: error.into(),
        }
    }

    /// Add context to the internal error. Works identically to `anyhow::context`
    pub fn context<C>(self, context: C) -> Self
    where
        C: std::fmt::Display + Send + Sync + 'static,
    {
        match self {
            Error::Transport { peer, error } => Self::Transport {
                peer,
                error: error.context(context),
            },
            Error::Store { error } => Self::Store {
                error: error.context(context),
            },
            Error::Feed { error } => Self::Feed {
                error: error.context(context),
            },
            Error::WorkerDied { error } => Self::WorkerDied {
                error: error.context(context),
            },
            invalid @ Error::InvalidState { .. } => invalid,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::WorkerDied {
            error: anyhow::anyhow!(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn context_is_prepended() {
        let err = Error::new_transport(PeerId::from("@a.ed25519"), anyhow::anyhow!("reset"))
            .context("blobs.has");
        expect!["Transport error talking to @a.ed25519: blobs.has"].assert_eq(&err.to_string());
        let Error::Transport { error, .. } = err else {
            panic!("expected transport error")
        };
        expect!["blobs.has: reset"].assert_eq(&format!("{error:#}"));
    }
}
