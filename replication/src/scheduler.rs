//! A bounded concurrency job that re-arms itself until its work reports it is done.
//!
//! Triggering a [`Job`] runs its work unless the job is already running `max_concurrent`
//! invocations, in which case the trigger is dropped rather than queued. Callers are expected to
//! trigger again when something changes. When the work reports [`Completion::Retry`] the job
//! triggers itself again after a delay drawn uniformly from `[delay/2, delay*3/2)`, so that many
//! jobs failing together do not retry in lock step.
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use rand::Rng;
use replica_metrics::Recorder;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::metrics::{Metrics, SchedulerRejected};

/// Result of a single invocation of the work of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Nothing more to do until the next external trigger.
    Done,
    /// Run again after a jittered delay.
    Retry,
}

type Work = Arc<dyn Fn() -> BoxFuture<'static, Completion> + Send + Sync>;

/// Handle to a scheduled job. Cheaply clonable, all clones share the same limits and timers.
#[derive(Clone)]
pub struct Job {
    inner: Arc<Inner>,
}

struct Inner {
    label: &'static str,
    delay: Duration,
    max_concurrent: usize,
    running: AtomicUsize,
    closed: AtomicBool,
    next_timer: AtomicU64,
    timers: Mutex<HashMap<u64, AbortHandle>>,
    work: Work,
    metrics: Metrics,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("label", &self.inner.label)
            .field("delay", &self.inner.delay)
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("running", &self.running())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

impl Job {
    /// Create a job. Nothing runs until the first [`Job::trigger`].
    pub fn new<F, Fut>(
        label: &'static str,
        delay: Duration,
        max_concurrent: usize,
        metrics: Metrics,
        work: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                label,
                delay,
                max_concurrent,
                running: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                next_timer: AtomicU64::new(0),
                timers: Mutex::new(HashMap::new()),
                work: Arc::new(move || work().boxed()),
                metrics,
            }),
        }
    }

    /// Run the work in a new task unless the job is at capacity or shut down.
    ///
    /// Returns whether the invocation was started. Must be called within a tokio runtime.
    pub fn trigger(&self) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        let max = self.inner.max_concurrent;
        let claimed = self
            .inner
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        if !claimed {
            trace!(job = self.inner.label, "at capacity, dropping trigger");
            self.inner.metrics.record(&SchedulerRejected {
                job: self.inner.label,
            });
            return false;
        }

        let job = self.clone();
        tokio::spawn(async move {
            let slot = Slot(job.inner.clone());
            let completion = (job.inner.work)().await;
            drop(slot);
            if completion == Completion::Retry {
                job.rearm();
            }
        });
        true
    }

    /// Cancel every pending retry. Running invocations are not interrupted.
    ///
    /// Returns the number of cancelled retries.
    pub fn cancel_all(&self) -> usize {
        let timers: Vec<_> = self
            .inner
            .timers
            .lock()
            .expect("should be able to acquire lock")
            .drain()
            .collect();
        for (_, timer) in &timers {
            timer.abort();
        }
        if !timers.is_empty() {
            debug!(
                job = self.inner.label,
                cancelled = timers.len(),
                "cancelled pending retries"
            );
        }
        timers.len()
    }

    /// Cancel every pending retry and refuse all future triggers.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.cancel_all();
    }

    /// Number of invocations currently running.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of retries waiting for their delay to elapse.
    pub fn pending_timers(&self) -> usize {
        self.inner
            .timers
            .lock()
            .expect("should be able to acquire lock")
            .len()
    }

    fn rearm(&self) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let wait = jittered(self.inner.delay);
        let id = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        trace!(job = self.inner.label, ?wait, "re-arming");
        // Hold the lock while spawning so the timer cannot remove itself before it is recorded.
        let mut timers = self
            .inner
            .timers
            .lock()
            .expect("should be able to acquire lock");
        let job = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            job.inner
                .timers
                .lock()
                .expect("should be able to acquire lock")
                .remove(&id);
            job.trigger();
        });
        timers.insert(id, timer.abort_handle());
    }
}

/// Releases a concurrency slot when dropped, including when the work panics.
struct Slot(Arc<Inner>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Draw a delay uniformly from `[delay/2, delay*3/2)`.
pub(crate) fn jittered(delay: Duration) -> Duration {
    let nanos = delay.as_nanos().min(u64::MAX as u128 / 2) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    let low = nanos / 2;
    Duration::from_nanos(rand::thread_rng().gen_range(low..low + nanos))
}
