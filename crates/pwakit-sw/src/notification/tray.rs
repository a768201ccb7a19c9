//! Notification display.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::debug;

use super::payload::{NotificationOptions, NotificationRequest};
use crate::{Result, ServiceWorkerError};

/// Identifier of a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(u64);

impl NotificationId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification-{}", self.0)
    }
}

/// A notification the platform is displaying.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub options: NotificationOptions,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(request: NotificationRequest) -> Self {
        Self {
            id: NotificationId::new(),
            title: request.title,
            options: request.options,
            timestamp: Utc::now(),
        }
    }

    /// Click target: `data.url` when it is a non-empty string, else `default`.
    pub fn target_url<'a>(&'a self, default: &'a str) -> &'a str {
        self.options
            .data
            .get("url")
            .and_then(|url| url.as_str())
            .filter(|url| !url.is_empty())
            .unwrap_or(default)
    }
}

/// The host's notification display primitive.
pub trait NotificationPlatform: Send + Sync {
    /// Display a notification. A notification with the same tag is replaced.
    fn show(&self, request: NotificationRequest) -> BoxFuture<'_, Result<Notification>>;

    /// Close a notification. Returns false if it was not displayed.
    fn close(&self, id: NotificationId) -> bool;
}

/// In-process notification tray.
#[derive(Debug, Default)]
pub struct NotificationTray {
    shown: Mutex<Vec<Notification>>,
    alerts: AtomicUsize,
    denied: AtomicBool,
}

impl NotificationTray {
    pub fn new() -> Self {
        Self::default()
    }

    fn shown(&self) -> MutexGuard<'_, Vec<Notification>> {
        self.shown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Notifications currently displayed, oldest first.
    pub fn displayed(&self) -> Vec<Notification> {
        self.shown().clone()
    }

    /// The displayed notification with `tag`, if any.
    pub fn get_by_tag(&self, tag: &str) -> Option<Notification> {
        self.shown().iter().find(|n| n.options.tag == tag).cloned()
    }

    /// How many times the user was alerted (sound/vibration).
    pub fn alerts(&self) -> usize {
        self.alerts.load(Ordering::SeqCst)
    }

    /// Simulate the user revoking notification permission.
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    fn display(&self, request: NotificationRequest) -> Result<Notification> {
        request.validate()?;
        if self.denied.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::Notification(
                "notification permission denied".to_string(),
            ));
        }

        let notification = Notification::new(request);
        let mut shown = self.shown();

        let replaced = if notification.options.tag.is_empty() {
            None
        } else {
            shown
                .iter()
                .position(|n| n.options.tag == notification.options.tag)
                .map(|index| shown.remove(index))
        };

        if replaced.is_none() || notification.options.renotify {
            self.alerts.fetch_add(1, Ordering::SeqCst);
        }

        debug!(
            id = %notification.id,
            tag = %notification.options.tag,
            replaced = replaced.is_some(),
            "Notification displayed"
        );
        shown.push(notification.clone());
        Ok(notification)
    }
}

impl NotificationPlatform for NotificationTray {
    fn show(&self, request: NotificationRequest) -> BoxFuture<'_, Result<Notification>> {
        let result = self.display(request);
        Box::pin(async move { result })
    }

    fn close(&self, id: NotificationId) -> bool {
        let mut shown = self.shown();
        match shown.iter().position(|n| n.id == id) {
            Some(index) => {
                shown.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationDefaults;
    use crate::notification::payload::{NotificationPayload, NotificationSource};
    use serde_json::json;

    fn request(tag: &str) -> NotificationRequest {
        NotificationPayload {
            tag: Some(tag.to_string()),
            ..Default::default()
        }
        .into_request(NotificationSource::Push, &NotificationDefaults::default())
    }

    #[tokio::test]
    async fn test_same_tag_replaces_and_realerts() {
        let tray = NotificationTray::new();
        let first = tray.show(request("rent")).await.unwrap();
        let second = tray.show(request("rent")).await.unwrap();
        tray.show(request("groceries")).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(tray.displayed().len(), 2);
        assert_eq!(tray.get_by_tag("rent").unwrap().id, second.id);
        assert_eq!(tray.alerts(), 3);
    }

    #[tokio::test]
    async fn test_close() {
        let tray = NotificationTray::new();
        let shown = tray.show(request("rent")).await.unwrap();
        assert!(tray.close(shown.id));
        assert!(!tray.close(shown.id));
        assert!(tray.displayed().is_empty());
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let tray = NotificationTray::new();
        tray.set_denied(true);
        assert!(tray.show(request("rent")).await.is_err());
        assert!(tray.displayed().is_empty());
        assert_eq!(tray.alerts(), 0);
    }

    #[test]
    fn test_target_url() {
        let mut notification = Notification::new(request("rent"));
        assert_eq!(notification.target_url("./fallback.html"), "./index.html");

        notification.options.data = json!({ "url": "" });
        assert_eq!(notification.target_url("./fallback.html"), "./fallback.html");

        notification.options.data = json!("not an object");
        assert_eq!(notification.target_url("./fallback.html"), "./fallback.html");
    }
}
