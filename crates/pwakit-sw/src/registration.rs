//! Registration: the installing, waiting and active workers of one scope.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::fetch::{FetchEvent, FetchOutcome};
use crate::lifecycle::InstallReport;
use crate::worker::{OfflineWorker, WorkerHost};
use crate::{Result, ServiceWorkerError};

#[derive(Debug, Default)]
struct Slots {
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
}

/// A service worker registration.
///
/// A newly registered version installs while the previous active worker
/// keeps serving fetches. It takes over once it activates.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    scope: Url,
    host: WorkerHost,
    slots: RwLock<Slots>,
}

impl ServiceWorkerRegistration {
    pub fn new(host: WorkerHost, scope: Url) -> Self {
        Self {
            scope,
            host,
            slots: RwLock::new(Slots::default()),
        }
    }

    /// Registration scope.
    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn host(&self) -> &WorkerHost {
        &self.host
    }

    pub async fn installing(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.active.clone()
    }

    /// Install a worker for `config`, then activate it if nothing is
    /// active or it skips waiting.
    pub async fn register(&self, config: WorkerConfig) -> Result<(Arc<OfflineWorker>, InstallReport)> {
        let scope = config.scope_url()?;
        if scope != self.scope {
            return Err(ServiceWorkerError::StateError(format!(
                "worker scope {} does not match registration scope {}",
                scope, self.scope
            )));
        }

        let worker = Arc::new(OfflineWorker::new(config, &self.host)?);
        let superseded = self.slots.write().await.installing.replace(Arc::clone(&worker));
        if let Some(previous) = superseded {
            previous.mark_redundant().await?;
        }

        let installed = worker.install().await;
        let (has_active, replaced) = {
            let mut slots = self.slots.write().await;
            if slots
                .installing
                .as_ref()
                .is_some_and(|w| w.id() == worker.id())
            {
                slots.installing = None;
            }
            if installed.is_err() {
                return installed.map(|report| (worker, report));
            }
            let replaced = slots.waiting.replace(Arc::clone(&worker));
            (slots.active.is_some(), replaced)
        };

        if let Some(replaced) = replaced {
            replaced.mark_redundant().await?;
        }

        let report = installed?;
        info!(worker = %worker.id(), cache = %report.cache_name, "Worker installed");

        if !has_active || worker.config().skip_waiting {
            self.activate_waiting().await?;
        }
        Ok((worker, report))
    }

    /// Promote the waiting worker, retiring the active one.
    pub async fn activate_waiting(&self) -> Result<Option<Arc<OfflineWorker>>> {
        let (next, previous) = {
            let mut slots = self.slots.write().await;
            let Some(next) = slots.waiting.take() else {
                return Ok(None);
            };
            let previous = slots.active.replace(Arc::clone(&next));
            (next, previous)
        };

        if let Some(previous) = previous {
            previous.mark_redundant().await?;
            info!(old = %previous.id(), new = %next.id(), "Active worker replaced");
        }

        next.activate().await?;
        Ok(Some(next))
    }

    /// The worker controlling pages in this scope.
    pub async fn controller(&self) -> Option<Arc<OfflineWorker>> {
        self.active().await
    }

    /// Route a fetch to the active worker.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchOutcome {
        match self.active().await {
            Some(worker) => worker.handle_fetch(event).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Retire every worker. Returns false if nothing was registered.
    pub async fn unregister(&self) -> bool {
        let workers: Vec<_> = {
            let mut slots = self.slots.write().await;
            [slots.installing.take(), slots.waiting.take(), slots.active.take()]
                .into_iter()
                .flatten()
                .collect()
        };

        for worker in &workers {
            if let Err(e) = worker.mark_redundant().await {
                warn!(worker = %worker.id(), error = %e, "Could not retire worker");
            }
        }
        !workers.is_empty()
    }
}
