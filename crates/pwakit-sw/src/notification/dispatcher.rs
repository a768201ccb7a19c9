//! Routes messages, pushes and clicks to the notification platform.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use super::message::{ClientMessage, LastNotificationSlot};
use super::payload::{NotificationPayload, NotificationRequest, NotificationSource, PushDecoding};
use super::tray::{Notification, NotificationPlatform};
use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::config::WorkerConfig;
use crate::event::HostEvent;
use crate::lifecycle::ServiceWorkerId;
use crate::lifetime::{ExtendableEvent, LifetimeTracker};
use crate::Result;

/// A push message.
#[derive(Debug, Clone, Default)]
pub struct PushEvent {
    /// Opaque payload; absent when the sender attached none.
    pub data: Option<Bytes>,
}

impl PushEvent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// The user clicked a notification.
#[derive(Debug, Clone)]
pub struct NotificationClickEvent {
    pub notification: Notification,
}

impl NotificationClickEvent {
    pub fn new(notification: Notification) -> Self {
        Self { notification }
    }
}

/// Turns worker events into notifications and window actions.
pub struct NotificationDispatcher {
    worker_id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    platform: Arc<dyn NotificationPlatform>,
    clients: Arc<RwLock<Clients>>,
    last: LastNotificationSlot,
    tracker: LifetimeTracker,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("worker_id", &self.worker_id)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    pub fn new(
        worker_id: ServiceWorkerId,
        config: Arc<WorkerConfig>,
        platform: Arc<dyn NotificationPlatform>,
        clients: Arc<RwLock<Clients>>,
        tracker: LifetimeTracker,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            worker_id,
            config,
            platform,
            clients,
            last: LastNotificationSlot::new(),
            tracker,
            events,
        }
    }

    /// Payload most recently stored by a page.
    pub fn last_notification(&self) -> &LastNotificationSlot {
        &self.last
    }

    /// Display `request` inside `event`'s lifetime.
    fn show_within(&self, event: &mut ExtendableEvent, request: NotificationRequest) {
        let platform = Arc::clone(&self.platform);
        let events = self.events.clone();

        event.wait_until(async move {
            let notification = platform.show(request).await?;
            let _ = events.send(HostEvent::NotificationShown {
                id: notification.id,
                title: notification.title.clone(),
                tag: notification.options.tag.clone(),
            });
            Ok(())
        });
    }

    /// Handle a page message.
    pub async fn handle_message(&self, message: &JsonValue) -> Result<()> {
        let Some(message) = ClientMessage::parse(message) else {
            debug!("Ignoring unrecognized message");
            return Ok(());
        };

        match message {
            ClientMessage::StoreLastNotification(payload) => {
                self.last.store(payload);
                debug!(stored = self.last.get().is_some(), "Last notification updated");
                Ok(())
            }
            ClientMessage::ShowNotification(payload) => {
                let payload = payload
                    .as_ref()
                    .map(NotificationPayload::from_value)
                    .unwrap_or_default();
                let request =
                    payload.into_request(NotificationSource::Message, &self.config.notifications);

                let mut event = ExtendableEvent::new("message", self.tracker.clone());
                self.show_within(&mut event, request);
                event.finish().await
            }
        }
    }

    /// Handle a push. Always attempts exactly one notification.
    pub async fn handle_push(&self, push: PushEvent) -> Result<()> {
        let (payload, decoding) = NotificationPayload::decode_push(push.data.as_deref());
        if decoding != PushDecoding::Structured {
            debug!(?decoding, "Push payload fell back");
        }
        let request = payload.into_request(NotificationSource::Push, &self.config.notifications);

        let mut event = ExtendableEvent::new("push", self.tracker.clone());
        self.show_within(&mut event, request);
        event.finish().await
    }

    /// Handle a click: close the notification, then bring a window to the
    /// target URL, opening one if none exists.
    pub async fn handle_click(&self, click: NotificationClickEvent) -> Result<()> {
        let notification = click.notification;
        if self.platform.close(notification.id) {
            let _ = self.events.send(HostEvent::NotificationClosed {
                id: notification.id,
            });
        }

        let target = self
            .config
            .resolve(notification.target_url(&self.config.notifications.url))?;

        let clients = Arc::clone(&self.clients);
        let worker = self.worker_id;
        let mut event = ExtendableEvent::new("notificationclick", self.tracker.clone());

        event.wait_until(async move {
            let mut clients = clients.write().await;
            let windows = clients.match_all(
                &ClientMatchOptions {
                    include_uncontrolled: true,
                    client_type: ClientType::Window,
                },
                worker,
            );

            let existing = windows
                .iter()
                .find(|c| c.url == target)
                .or_else(|| windows.first());

            match existing {
                Some(client) => {
                    if let Err(e) = clients.navigate(&client.id, target.clone(), worker) {
                        debug!(client = %client.id, error = %e, "Navigation refused");
                    }
                    clients.focus(&client.id)?;
                    info!(client = %client.id, url = %target, "Focused existing window");
                }
                None => {
                    let opened = clients.open_window(target, worker);
                    info!(client = %opened.id, url = %opened.url, "Opened window");
                }
            }
            Ok(())
        });

        event.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use crate::notification::NotificationTray;
    use crate::ServiceWorkerError;
    use serde_json::json;
    use url::Url;

    struct Harness {
        dispatcher: NotificationDispatcher,
        tray: Arc<NotificationTray>,
        clients: Arc<RwLock<Clients>>,
        events: mpsc::UnboundedReceiver<HostEvent>,
        worker: ServiceWorkerId,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let tray = Arc::new(NotificationTray::new());
        let clients = Arc::new(RwLock::new(Clients::with_events(tx.clone())));
        let worker = ServiceWorkerId::new();
        let dispatcher = NotificationDispatcher::new(
            worker,
            Arc::new(WorkerConfig::for_scope("https://app.test/")),
            tray.clone(),
            clients.clone(),
            LifetimeTracker::new(),
            tx,
        );
        Harness {
            dispatcher,
            tray,
            clients,
            events: rx,
            worker,
        }
    }

    #[tokio::test]
    async fn test_show_notification_message() {
        let h = harness();
        h.dispatcher
            .handle_message(&json!({
                "type": "SHOW_NOTIFICATION",
                "payload": { "title": "Conta de luz", "body": "Vence amanhã" }
            }))
            .await
            .unwrap();

        let shown = h.tray.displayed();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Conta de luz");
        assert_eq!(shown[0].options.body, "Vence amanhã");
        assert_eq!(shown[0].options.tag, "gastos-pro-manual");
    }

    #[tokio::test]
    async fn test_show_notification_without_payload() {
        let h = harness();
        h.dispatcher
            .handle_message(&json!({ "type": "SHOW_NOTIFICATION" }))
            .await
            .unwrap();
        assert_eq!(h.tray.displayed()[0].options.body, "Você tem um lembrete.");
    }

    #[tokio::test]
    async fn test_store_last_notification() {
        let h = harness();
        h.dispatcher
            .handle_message(&json!({ "type": "STORE_LAST_NOTIFICATION", "payload": { "title": "x" } }))
            .await
            .unwrap();
        assert_eq!(h.dispatcher.last_notification().get(), Some(json!({ "title": "x" })));

        h.dispatcher
            .handle_message(&json!({ "type": "STORE_LAST_NOTIFICATION" }))
            .await
            .unwrap();
        assert!(h.dispatcher.last_notification().get().is_none());
        assert!(h.tray.displayed().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_message_ignored() {
        let h = harness();
        h.dispatcher.handle_message(&json!({ "type": "SYNC" })).await.unwrap();
        h.dispatcher.handle_message(&json!(null)).await.unwrap();
        assert!(h.tray.displayed().is_empty());
    }

    #[tokio::test]
    async fn test_push_garbage_shows_defaults() {
        let mut h = harness();
        h.dispatcher
            .handle_push(PushEvent::new(Bytes::from_static(&[0xc3, 0x28])))
            .await
            .unwrap();

        let shown = h.tray.displayed();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Controle de Gastos PRO");
        assert_eq!(shown[0].options.body, "Você tem um novo lembrete.");
        assert_eq!(shown[0].options.tag, "gastos-pro-push");
        assert_eq!(shown[0].options.data, json!({ "url": "./index.html" }));
        assert!(matches!(
            h.events.try_recv().unwrap(),
            HostEvent::NotificationShown { .. }
        ));
    }

    #[tokio::test]
    async fn test_push_display_failure_is_reported() {
        let h = harness();
        h.tray.set_denied(true);
        let err = h.dispatcher.handle_push(PushEvent::empty()).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Notification(_)));
    }

    #[tokio::test]
    async fn test_click_opens_window_when_none() {
        let h = harness();
        let shown = h
            .tray
            .show(NotificationPayload::default().into_request(
                NotificationSource::Push,
                &Default::default(),
            ))
            .await
            .unwrap();

        h.dispatcher
            .handle_click(NotificationClickEvent::new(shown))
            .await
            .unwrap();

        assert!(h.tray.displayed().is_empty());
        let clients = h.clients.read().await;
        assert_eq!(clients.len(), 1);
        let opened = clients
            .match_all(&ClientMatchOptions::default(), h.worker)
            .remove(0);
        assert_eq!(opened.url.as_str(), "https://app.test/index.html");
        assert!(opened.focused);
    }

    #[tokio::test]
    async fn test_click_prefers_window_at_target() {
        let h = harness();
        let other = Client::window(Url::parse("https://app.test/settings.html").unwrap());
        let at_target = Client::window(Url::parse("https://app.test/reports.html").unwrap());
        let target_id = at_target.id.clone();
        {
            let mut clients = h.clients.write().await;
            clients.add(other);
            clients.add(at_target);
        }

        let notification = Notification::new(
            NotificationPayload::from_value(&json!({ "data": { "url": "./reports.html" } }))
                .into_request(NotificationSource::Message, &Default::default()),
        );
        h.dispatcher
            .handle_click(NotificationClickEvent::new(notification))
            .await
            .unwrap();

        let clients = h.clients.read().await;
        assert_eq!(clients.len(), 2);
        assert!(clients.get(&target_id).unwrap().focused);
    }

    #[tokio::test]
    async fn test_click_on_uncontrolled_window_focuses_without_navigating() {
        let h = harness();
        let page = Client::window(Url::parse("https://app.test/").unwrap());
        let id = page.id.clone();
        h.clients.write().await.add(page);

        let notification = Notification::new(
            NotificationPayload::default()
                .into_request(NotificationSource::Push, &Default::default()),
        );
        h.dispatcher
            .handle_click(NotificationClickEvent::new(notification))
            .await
            .unwrap();

        let clients = h.clients.read().await;
        let page = clients.get(&id).unwrap();
        assert!(page.focused);
        assert_eq!(page.url.as_str(), "https://app.test/");
        assert_eq!(clients.len(), 1);
    }
}
