//! # PwaKit Service Worker
//!
//! Offline caching and notification worker for a browser-hosted application.
//!
//! ## Features
//!
//! - **Versioned cache**: one cache per deployed build, stale builds pruned on activation
//! - **Fetch interception**: cache-first GET handling with an offline document fallback
//! - **Notifications**: foreground `SHOW_NOTIFICATION` messages, push events, clicks
//! - **Lifetime extension**: `wait_until` work the host drains before teardown
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerRegistration
//!     ├── installing (OfflineWorker)
//!     ├── waiting    (OfflineWorker)
//!     └── active     (OfflineWorker)
//!             ├── CacheManager ──────────┐
//!             ├── FetchInterceptor ──────┤── CacheStorage (memory | sqlite)
//!             ├── NotificationDispatcher ─── NotificationPlatform, Clients
//!             └── LifetimeTracker
//! ```

use pwakit_common::PwaKitError;
use pwakit_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod event;
pub mod fetch;
pub mod lifecycle;
pub mod lifetime;
pub mod notification;
pub mod registration;
pub mod worker;

pub use cache::{Cache, CacheBackend, CacheEntry, CacheKey, CacheStorage};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::{InstallPolicy, InstallRetry, NotificationDefaults, OfflineFallback, WorkerConfig};
pub use event::{HostEvent, WorkerEvent};
pub use fetch::{FetchEvent, FetchInterceptor, FetchOutcome, ResponseSource};
pub use lifecycle::{CacheManager, InstallReport, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
pub use lifetime::{ExtendableEvent, LifetimeTracker};
pub use notification::{
    ClientMessage, LastNotificationSlot, Notification, NotificationClickEvent,
    NotificationDispatcher, NotificationId, NotificationOptions, NotificationPayload,
    NotificationPlatform, NotificationRequest, NotificationSource, NotificationTray, PushDecoding,
    PushEvent,
};
pub use registration::ServiceWorkerRegistration;
pub use worker::{OfflineWorker, WorkerHost};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] PwaKitError),
}

impl ServiceWorkerError {
    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::InstallFailed(_) => "install",
            ServiceWorkerError::StateError(_) => "state",
            ServiceWorkerError::CacheError(_) | ServiceWorkerError::Storage(_) => "cache",
            ServiceWorkerError::Network(_) => "network",
            ServiceWorkerError::Notification(_) => "notification",
            ServiceWorkerError::Client(_) => "client",
            ServiceWorkerError::NotFound(_) => "not_found",
            ServiceWorkerError::Common(e) => e.category(),
        }
    }
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(ServiceWorkerError::CacheError("x".into()).category(), "cache");
        assert_eq!(
            ServiceWorkerError::Network(NetError::Offline("x".into())).category(),
            "network"
        );
        assert_eq!(
            ServiceWorkerError::Common(PwaKitError::config("scope")).category(),
            "config"
        );
    }
}
