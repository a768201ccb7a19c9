//! The offline worker: one instance per deployed version.

use std::fmt;
use std::sync::Arc;

use pwakit_net::{NetError, NetworkFetcher, Request, Response};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::event::{HostEvent, WorkerEvent};
use crate::fetch::{FetchEvent, FetchInterceptor, FetchOutcome};
use crate::lifecycle::{
    CacheManager, InstallReport, ServiceWorker, ServiceWorkerId, ServiceWorkerState,
};
use crate::lifetime::LifetimeTracker;
use crate::notification::{
    NotificationClickEvent, NotificationDispatcher, NotificationPlatform, PushEvent,
};
use crate::Result;

// ==================== Host ====================

/// Everything a worker borrows from its embedder.
#[derive(Clone)]
pub struct WorkerHost {
    pub storage: CacheStorage,
    pub fetcher: Arc<dyn NetworkFetcher>,
    pub platform: Arc<dyn NotificationPlatform>,
    pub clients: Arc<RwLock<Clients>>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHost")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl WorkerHost {
    /// Create a host and the receiver its [`HostEvent`]s arrive on.
    pub fn new(
        storage: CacheStorage,
        fetcher: Arc<dyn NetworkFetcher>,
        platform: Arc<dyn NotificationPlatform>,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                storage,
                fetcher,
                platform,
                clients: Arc::new(RwLock::new(Clients::with_events(events.clone()))),
                events,
            },
            rx,
        )
    }

    /// Report that the user opened a page at `url`.
    pub async fn open_page(&self, url: Url) -> Client {
        let client = Client::window(url);
        self.clients.write().await.add(client.clone());
        client
    }

    /// Report that the user closed a page.
    pub async fn close_page(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    pub(crate) fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}

// ==================== Worker ====================

/// A worker instance bound to one cache version.
pub struct OfflineWorker {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    record: RwLock<ServiceWorker>,
    host: WorkerHost,
    cache_manager: CacheManager,
    interceptor: FetchInterceptor,
    notifications: NotificationDispatcher,
    tracker: LifetimeTracker,
}

impl fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("cache_name", &self.config.cache_name)
            .finish_non_exhaustive()
    }
}

impl OfflineWorker {
    /// Create a worker in the `parsed` state.
    pub fn new(config: WorkerConfig, host: &WorkerHost) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let record = ServiceWorker::new(config.cache_name.clone());
        let id = record.id;
        let tracker = LifetimeTracker::new();

        Ok(Self {
            id,
            cache_manager: CacheManager::new(
                Arc::clone(&config),
                host.storage.clone(),
                Arc::clone(&host.fetcher),
            ),
            interceptor: FetchInterceptor::new(
                Arc::clone(&config),
                host.storage.clone(),
                Arc::clone(&host.fetcher),
                tracker.clone(),
            ),
            notifications: NotificationDispatcher::new(
                id,
                Arc::clone(&config),
                Arc::clone(&host.platform),
                Arc::clone(&host.clients),
                tracker.clone(),
                host.events.clone(),
            ),
            record: RwLock::new(record),
            host: host.clone(),
            config,
            tracker,
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn tracker(&self) -> &LifetimeTracker {
        &self.tracker
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.record.read().await.state
    }

    /// Copy of the lifecycle record.
    pub async fn snapshot(&self) -> ServiceWorker {
        self.record.read().await.clone()
    }

    async fn set_state(&self, state: ServiceWorkerState) -> Result<()> {
        self.record.write().await.set_state(state)?;
        self.host.emit(HostEvent::StateChange {
            worker_id: self.id,
            state,
        });
        Ok(())
    }

    /// Run the install step: populate the app shell.
    ///
    /// On failure the worker becomes redundant and never activates.
    pub async fn install(&self) -> Result<InstallReport> {
        self.set_state(ServiceWorkerState::Installing).await?;
        info!(worker = %self.id, cache = %self.config.cache_name, "Installing");

        match self.cache_manager.install().await {
            Ok(report) => {
                self.set_state(ServiceWorkerState::Installed).await?;
                Ok(report)
            }
            Err(e) => {
                warn!(worker = %self.id, category = e.category(), error = %e, "Install failed");
                self.record.write().await.error = Some(e.to_string());
                self.set_state(ServiceWorkerState::Redundant).await?;
                Err(e)
            }
        }
    }

    /// Run the activate step: prune stale caches and claim open pages.
    /// Returns the deleted cache names.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.set_state(ServiceWorkerState::Activating).await?;

        let deleted = match self.cache_manager.activate().await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "Cache pruning failed");
                Vec::new()
            }
        };
        if !deleted.is_empty() {
            self.host.emit(HostEvent::CachesDeleted {
                names: deleted.clone(),
            });
        }

        self.set_state(ServiceWorkerState::Activated).await?;

        let scope = self.config.scope_url()?;
        let claimed = self.host.clients.write().await.claim(self.id, &scope);
        info!(worker = %self.id, claimed, "Activated");
        Ok(deleted)
    }

    /// Retire this worker.
    pub async fn mark_redundant(&self) -> Result<()> {
        if self.state().await == ServiceWorkerState::Redundant {
            return Ok(());
        }
        self.set_state(ServiceWorkerState::Redundant).await
    }

    /// Intercept a request. Workers that are not yet active let it through.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchOutcome {
        if self.state().await != ServiceWorkerState::Activated {
            return FetchOutcome::Passthrough;
        }
        self.interceptor.handle(event).await
    }

    /// Resolve a request the way a controlled page would see it.
    pub async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
        let url = request.url.clone();
        match self.handle_fetch(FetchEvent::new(request.clone())).await {
            FetchOutcome::Respond { response, .. } => Ok(response),
            FetchOutcome::Passthrough => self.host.fetcher.fetch(request).await,
            FetchOutcome::NetworkError => Err(NetError::Offline(url.to_string())),
        }
    }

    pub async fn handle_message(&self, message: &JsonValue) -> Result<()> {
        self.notifications.handle_message(message).await
    }

    pub async fn handle_push(&self, event: PushEvent) -> Result<()> {
        self.notifications.handle_push(event).await
    }

    pub async fn handle_notification_click(&self, event: NotificationClickEvent) -> Result<()> {
        self.notifications.handle_click(event).await
    }

    /// Handle one event to completion.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Fetch { event, respond_to } => {
                let outcome = self.handle_fetch(event).await;
                if respond_to.send(outcome).is_err() {
                    debug!(worker = %self.id, "Fetch requester went away");
                }
                Ok(())
            }
            WorkerEvent::Message(message) => self.handle_message(&message).await,
            WorkerEvent::Push(push) => self.handle_push(push).await,
            WorkerEvent::NotificationClick(click) => self.handle_notification_click(click).await,
        }
    }

    /// Serve events until the channel closes, one task per event, then wait
    /// for every extended lifetime to settle.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<WorkerEvent>) {
        debug!(worker = %self.id, "Event loop started");

        while let Some(event) = events.recv().await {
            let worker = Arc::clone(&self);
            let kind = event.kind();
            self.tracker
                .extend(kind, async move { worker.dispatch(event).await });
        }

        self.tracker.idle().await;
        debug!(worker = %self.id, "Event loop drained");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, events: mpsc::Receiver<WorkerEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Wait until no extended work is outstanding.
    pub async fn wait_until_idle(&self) {
        self.tracker.idle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationTray;
    use pwakit_net::MemoryFetcher;
    use serde_json::json;

    fn origin() -> Arc<MemoryFetcher> {
        let fetcher = Arc::new(MemoryFetcher::new());
        for path in [
            "",
            "index.html",
            "manifest.json",
            "config.js",
            "icons/icon-192.png",
            "icons/icon-512.png",
        ] {
            fetcher.route(&format!("https://app.test/{}", path), format!("/{}", path));
        }
        fetcher
    }

    fn host(
        fetcher: Arc<MemoryFetcher>,
    ) -> (WorkerHost, Arc<NotificationTray>, mpsc::UnboundedReceiver<HostEvent>) {
        let tray = Arc::new(NotificationTray::new());
        let (host, rx) = WorkerHost::new(CacheStorage::in_memory(), fetcher, tray.clone());
        (host, tray, rx)
    }

    #[tokio::test]
    async fn test_lifecycle_emits_states() {
        let (host, _, mut rx) = host(origin());
        let worker = OfflineWorker::new(WorkerConfig::for_scope("https://app.test/"), &host).unwrap();

        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Activated);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let HostEvent::StateChange { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_inactive_worker_passes_through() {
        let (host, _, _rx) = host(origin());
        let worker = OfflineWorker::new(WorkerConfig::for_scope("https://app.test/"), &host).unwrap();
        worker.install().await.unwrap();

        let outcome = worker
            .handle_fetch(FetchEvent::new(Request::parse_get("https://app.test/").unwrap()))
            .await;
        assert!(outcome.is_passthrough());
    }

    #[tokio::test]
    async fn test_activate_claims_open_pages() {
        let (host, _, _rx) = host(origin());
        let page = host.open_page(Url::parse("https://app.test/index.html").unwrap()).await;
        let worker = OfflineWorker::new(WorkerConfig::for_scope("https://app.test/"), &host).unwrap();
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let clients = host.clients.read().await;
        assert_eq!(clients.get(&page.id).unwrap().controller, Some(worker.id()));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (host, _, _rx) = host(origin());
        let config = WorkerConfig {
            cache_name: String::new(),
            ..WorkerConfig::for_scope("https://app.test/")
        };
        assert!(OfflineWorker::new(config, &host).is_err());
    }

    #[tokio::test]
    async fn test_run_serves_events_until_closed() {
        let fetcher = origin();
        let (host, tray, _rx) = host(fetcher.clone());
        let worker = Arc::new(
            OfflineWorker::new(WorkerConfig::for_scope("https://app.test/"), &host).unwrap(),
        );
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handle = Arc::clone(&worker).spawn(rx);

        let (fetch, reply) = WorkerEvent::fetch(Request::parse_get("https://app.test/config.js").unwrap());
        tx.send(fetch).await.unwrap();
        tx.send(WorkerEvent::Push(PushEvent::new("Pagar aluguel"))).await.unwrap();
        tx.send(WorkerEvent::Message(json!({ "type": "SHOW_NOTIFICATION" })))
            .await
            .unwrap();
        drop(tx);

        let outcome = reply.await.unwrap();
        assert_eq!(outcome.response().unwrap().body().as_ref(), b"/config.js");

        handle.await.unwrap();
        assert!(worker.tracker().is_idle());
        assert_eq!(tray.displayed().len(), 2);
        assert_eq!(fetcher.hits("https://app.test/config.js"), 1);
    }
}
