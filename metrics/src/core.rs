use std::sync::Mutex;

use prometheus_client::{encoding::text::encode, registry::Registry};

lazy_static! {
    pub(crate) static ref CORE: Core = Core::default();
}

/// Process wide registry all crates register their metrics into.
#[derive(Default)]
pub(crate) struct Core {
    registry: Mutex<Registry>,
}

impl Core {
    pub fn register<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut Registry) -> T,
    {
        f(&mut self
            .registry
            .lock()
            .expect("should be able to acquire lock"))
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = String::new();
        let registry = self
            .registry
            .lock()
            .expect("should be able to acquire lock");
        if let Err(err) = encode(&mut buf, &registry) {
            tracing::warn!(%err, "failed to encode metrics");
        }
        buf.into()
    }
}
