//! Events flowing between the host and the worker.

use pwakit_net::Request;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use url::Url;

use crate::fetch::{FetchEvent, FetchOutcome};
use crate::lifecycle::{ServiceWorkerId, ServiceWorkerState};
use crate::notification::{NotificationClickEvent, NotificationId, PushEvent};

/// Events the host delivers to a worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// An outbound request from a controlled page.
    Fetch {
        event: FetchEvent,
        respond_to: oneshot::Sender<FetchOutcome>,
    },
    /// `postMessage` from a page.
    Message(JsonValue),
    /// A push message arrived.
    Push(PushEvent),
    /// The user clicked a displayed notification.
    NotificationClick(NotificationClickEvent),
}

impl WorkerEvent {
    /// Build a fetch event and the receiver its outcome arrives on.
    pub fn fetch(request: Request) -> (Self, oneshot::Receiver<FetchOutcome>) {
        let (respond_to, rx) = oneshot::channel();
        (
            WorkerEvent::Fetch {
                event: FetchEvent::new(request),
                respond_to,
            },
            rx,
        )
    }

    /// Event name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Fetch { .. } => "fetch",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::NotificationClick(_) => "notificationclick",
        }
    }
}

/// Side effects the worker asks the host to carry out or observe.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Worker state changed.
    StateChange {
        worker_id: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// Stale caches removed during activation.
    CachesDeleted { names: Vec<String> },
    /// A worker took control of open pages.
    ClientsClaimed {
        worker_id: ServiceWorkerId,
        count: usize,
    },
    /// A notification was displayed.
    NotificationShown {
        id: NotificationId,
        title: String,
        tag: String,
    },
    /// A notification was closed.
    NotificationClosed { id: NotificationId },
    /// A window should load `url`.
    ClientNavigated { client_id: String, url: Url },
    /// A window should come to the front.
    ClientFocused { client_id: String },
    /// A new window should open at `url`.
    WindowOpened { client_id: String, url: Url },
}
