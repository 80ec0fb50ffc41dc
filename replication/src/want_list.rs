//! The set of blobs the local node wants, with what is known about which peers have them.
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use indexmap::IndexMap;
use replica_core::{BlobId, PeerId};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{config::MAX_NOTFOUNDS, Error, Result};

/// Lifecycle of a wanted blob. Satisfied blobs are removed from the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantState {
    /// No peer is known to have the blob.
    Waiting,
    /// At least one peer is believed to have the blob.
    Ready,
    /// A download is transferring the blob.
    Downloading,
}

impl WantState {
    fn name(self) -> &'static str {
        match self {
            WantState::Waiting => "waiting",
            WantState::Ready => "ready",
            WantState::Downloading => "downloading",
        }
    }
}

/// Point in time copy of a want-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantSnapshot {
    /// The wanted blob
    pub id: BlobId,
    /// Current state
    pub state: WantState,
    /// What each peer answered. Peers missing from the map have not been asked.
    pub has: IndexMap<PeerId, bool>,
    /// Number of negative answers, clamped. Higher means less likely to be found.
    pub notfounds: u8,
}

impl WantSnapshot {
    /// Peers confirmed to have the blob, in the order they were learned.
    pub fn found_at(&self) -> impl Iterator<Item = &PeerId> {
        self.has
            .iter()
            .filter_map(|(peer, has)| has.then_some(peer))
    }
}

#[derive(Debug)]
struct Entry {
    state: WantState,
    has: IndexMap<PeerId, bool>,
    notfounds: u8,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: WantState::Waiting,
            has: IndexMap::new(),
            notfounds: 0,
            waiters: Vec::new(),
        }
    }

    fn snapshot(&self, id: &BlobId) -> WantSnapshot {
        WantSnapshot {
            id: id.clone(),
            state: self.state,
            has: self.has.clone(),
            notfounds: self.notfounds,
        }
    }

    fn finish(self) {
        for waiter in self.waiters {
            // The waiter may have given up, that is fine.
            let _ = waiter.send(());
        }
    }
}

/// Shared, ordered want-list. Clones refer to the same list.
///
/// All state transitions go through methods on this type, each of which is applied atomically.
#[derive(Debug, Clone)]
pub struct WantList {
    entries: Arc<Mutex<IndexMap<BlobId, Entry>>>,
    max_notfounds: u8,
}

impl Default for WantList {
    fn default() -> Self {
        Self::new(MAX_NOTFOUNDS)
    }
}

impl WantList {
    /// Create an empty want-list whose `notfounds` counters saturate at `max_notfounds`.
    pub fn new(max_notfounds: u8) -> Self {
        Self {
            entries: Default::default(),
            max_notfounds,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<BlobId, Entry>> {
        self.entries.lock().expect("should be able to acquire lock")
    }

    /// Start wanting a blob. Returns false if it was already wanted.
    pub fn queue(&self, id: BlobId) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return false;
        }
        debug!(blob = %id, "queued");
        entries.insert(id, Entry::new());
        true
    }

    /// Reports if the blob is still wanted.
    pub fn wants(&self, id: &BlobId) -> bool {
        self.lock().contains_key(id)
    }

    /// Copy of the entry for the blob, if wanted.
    pub fn get(&self, id: &BlobId) -> Option<WantSnapshot> {
        self.lock().get(id).map(|entry| entry.snapshot(id))
    }

    /// Visit every entry in list order.
    pub fn each(&self, mut f: impl FnMut(&WantSnapshot)) {
        for snapshot in self.subset(|_| true) {
            f(&snapshot);
        }
    }

    /// Entries matching the predicate, in list order.
    pub fn subset(&self, predicate: impl Fn(&WantSnapshot) -> bool) -> Vec<WantSnapshot> {
        self.lock()
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .filter(|snapshot| predicate(snapshot))
            .collect()
    }

    /// Number of wanted blobs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Reports if nothing is wanted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reports if the peer is recorded as having the blob.
    pub fn is_found_at(&self, id: &BlobId, peer: &PeerId) -> bool {
        self.lock()
            .get(id)
            .and_then(|entry| entry.has.get(peer).copied())
            .unwrap_or(false)
    }

    /// The `notfounds` counter of the blob, if wanted.
    pub fn notfounds(&self, id: &BlobId) -> Option<u8> {
        self.lock().get(id).map(|entry| entry.notfounds)
    }

    /// Record that the peer has the blob, making a waiting blob ready.
    ///
    /// Returns false if the blob is not wanted.
    pub fn set_found_at(&self, id: &BlobId, peer: &PeerId) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        entry.has.insert(peer.clone(), true);
        if entry.state == WantState::Waiting {
            entry.state = WantState::Ready;
        }
        true
    }

    /// Record that the peer does not have the blob and lower its priority.
    ///
    /// Returns the new `notfounds` value, or None if the blob is not wanted.
    pub fn record_not_found(&self, id: &BlobId, peer: &PeerId) -> Option<u8> {
        let mut entries = self.lock();
        let entry = entries.get_mut(id)?;
        entry.has.insert(peer.clone(), false);
        entry.notfounds = entry.notfounds.saturating_add(1).min(self.max_notfounds);
        Some(entry.notfounds)
    }

    /// Forget every negative answer from the peer so those blobs are asked about again.
    ///
    /// Returns the number of entries changed.
    pub fn clear_not_found(&self, peer: &PeerId) -> usize {
        let mut cleared = 0;
        for entry in self.lock().values_mut() {
            if entry.has.get(peer) == Some(&false) {
                entry.has.shift_remove(peer);
                cleared += 1;
            }
        }
        cleared
    }

    /// Move a ready blob to downloading. Fails if it is not ready.
    pub fn claim(&self, id: &BlobId) -> Result<WantSnapshot> {
        transition(
            &mut self.lock(),
            id,
            WantState::Ready,
            WantState::Downloading,
            |_| {},
        )
    }

    /// Move a downloading blob back to ready so it can be picked again.
    ///
    /// The blob goes to the back of the list and the peer the transfer failed with goes behind
    /// the other sources, so the next attempts prefer other blobs and other peers.
    pub fn release(&self, id: &BlobId, failed: &PeerId) -> Result<WantSnapshot> {
        let mut entries = self.lock();
        let snapshot = transition(
            &mut entries,
            id,
            WantState::Downloading,
            WantState::Ready,
            |entry| {
                if let Some(has) = entry.has.shift_remove(failed) {
                    entry.has.insert(failed.clone(), has);
                }
            },
        )?;
        if let Some(entry) = entries.shift_remove(id) {
            entries.insert(id.clone(), entry);
        }
        Ok(snapshot)
    }

    /// Mark the blob as satisfied: remove it and wake everything waiting for it.
    ///
    /// Returns false if the blob was not wanted.
    pub fn got(&self, id: &BlobId) -> bool {
        let removed = self.lock().shift_remove(id);
        match removed {
            Some(entry) => {
                debug!(blob = %id, "got");
                entry.finish();
                true
            }
            None => false,
        }
    }

    /// Stop wanting the blob without it being satisfied. Waiters are woken.
    pub fn forget(&self, id: &BlobId) -> bool {
        let removed = self.lock().shift_remove(id);
        match removed {
            Some(entry) => {
                debug!(blob = %id, "forgot");
                entry.finish();
                true
            }
            None => false,
        }
    }

    /// Resolves once the blob is no longer wanted, immediately if it is not wanted now.
    ///
    /// The wait is registered when this is called, not when the future is first polled.
    pub fn wait_for(&self, id: &BlobId) -> impl Future<Output = ()> + Send + 'static {
        let rx = self.lock().get_mut(id).map(|entry| {
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            rx
        });
        async move {
            if let Some(rx) = rx {
                // A dropped sender also means the entry is gone.
                let _ = rx.await;
            }
        }
    }
}

fn transition(
    entries: &mut IndexMap<BlobId, Entry>,
    id: &BlobId,
    from: WantState,
    to: WantState,
    update: impl FnOnce(&mut Entry),
) -> Result<WantSnapshot> {
    match entries.get_mut(id) {
        Some(entry) if entry.state == from => {
            entry.state = to;
            update(entry);
            Ok(entry.snapshot(id))
        }
        Some(entry) => Err(Error::InvalidState {
            blob: id.clone(),
            from: entry.state.name(),
            to: to.name(),
        }),
        None => Err(Error::InvalidState {
            blob: id.clone(),
            from: "untracked",
            to: to.name(),
        }),
    }
}
