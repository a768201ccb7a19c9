//! Event lifetime extension.
//!
//! A handler that starts asynchronous work the host must not abandon
//! (a cache write, a notification display, a client navigation) registers
//! it with [`ExtendableEvent::wait_until`]. Every registration is counted by
//! the worker-wide [`LifetimeTracker`]; the host awaits
//! [`LifetimeTracker::idle`] before tearing the worker down.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pwakit_common::ResultExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Result, ServiceWorkerError};

#[derive(Debug, Default)]
struct TrackerInner {
    pending: AtomicUsize,
    idle: Notify,
}

/// Counts outstanding extended work for one worker.
#[derive(Debug, Clone, Default)]
pub struct LifetimeTracker {
    inner: Arc<TrackerInner>,
}

struct PendingGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl LifetimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` and keep the worker alive until it settles.
    ///
    /// Must be called from within a tokio runtime.
    pub fn extend<F>(&self, label: &'static str, work: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
        };

        tokio::spawn(async move {
            let _guard = guard;
            let result = work.await;
            if let Err(ref e) = result {
                warn!(label, category = e.category(), error = %e, "Extended work failed");
            }
            result
        })
    }

    /// Number of unsettled extensions.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until no extended work is outstanding.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// One dispatched event whose lifetime can be extended.
#[derive(Debug)]
pub struct ExtendableEvent {
    kind: &'static str,
    tracker: LifetimeTracker,
    pending: Vec<JoinHandle<Result<()>>>,
}

impl ExtendableEvent {
    pub fn new(kind: &'static str, tracker: LifetimeTracker) -> Self {
        Self {
            kind,
            tracker,
            pending: Vec::new(),
        }
    }

    /// Event name, for logs.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Keep the event (and the worker) alive until `work` settles.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.pending.push(self.tracker.extend(self.kind, work));
    }

    /// Number of registered extensions.
    pub fn extensions(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every extension; the first failure becomes the event result.
    pub async fn finish(self) -> Result<()> {
        let mut first_error: Option<ServiceWorkerError> = None;
        let count = self.pending.len();

        for handle in self.pending {
            let outcome = match handle.await.context("extended work panicked") {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        debug!(event = self.kind, extensions = count, failed = first_error.is_some(), "Event settled");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
