//! Clients API: the application instances (windows) a worker can see.
//!
//! The registry is the worker's view of the host's open pages. Every
//! mutation is mirrored to the host as a [`HostEvent`] so the embedder can
//! carry it out on real windows.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::event::HostEvent;
use crate::lifecycle::ServiceWorkerId;
use crate::{Result, ServiceWorkerError};

// ==================== Client ====================

/// A client (open application instance).
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Current URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Frame type.
    pub frame_type: FrameType,

    /// Visibility state.
    pub visibility_state: VisibilityState,

    /// Whether focused.
    pub focused: bool,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Auxiliary,
    TopLevel,
    Nested,
    None,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

impl Client {
    /// A top-level window at `url`, not yet controlled.
    pub fn window(url: Url) -> Self {
        Self {
            id: format!("client-{}", uuid_simple()),
            url,
            client_type: ClientType::Window,
            frame_type: FrameType::TopLevel,
            visibility_state: VisibilityState::Visible,
            focused: false,
            controller: None,
        }
    }

    /// Check if this client can be focused or navigated.
    pub fn is_window(&self) -> bool {
        self.client_type == ClientType::Window
    }
}

/// Options for `clients.matchAll()`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

// ==================== Clients ====================

/// Clients registry, in the order the host reported them.
#[derive(Debug, Default)]
pub struct Clients {
    clients: Vec<Client>,
    events: Option<mpsc::UnboundedSender<HostEvent>>,
}

impl Clients {
    /// Create a registry that does not report to a host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that mirrors mutations to `events`.
    pub fn with_events(events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self {
            clients: Vec::new(),
            events: Some(events),
        }
    }

    fn emit(&self, event: HostEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Number of known clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Register a client the host opened.
    pub fn add(&mut self, client: Client) {
        self.clients.push(client);
    }

    /// Forget a client the host closed.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        let index = self.clients.iter().position(|c| c.id == id)?;
        Some(self.clients.remove(index))
    }

    /// Match clients visible to `worker`.
    pub fn match_all(&self, options: &ClientMatchOptions, worker: ServiceWorkerId) -> Vec<Client> {
        self.clients
            .iter()
            .filter(|c| options.include_uncontrolled || c.controller == Some(worker))
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .cloned()
            .collect()
    }

    /// Open a new focused window controlled by `worker`.
    pub fn open_window(&mut self, url: Url, worker: ServiceWorkerId) -> Client {
        for other in &mut self.clients {
            other.focused = false;
        }

        let mut client = Client::window(url);
        client.focused = true;
        client.controller = Some(worker);

        debug!(client = %client.id, url = %client.url, "Window opened");
        self.emit(HostEvent::WindowOpened {
            client_id: client.id.clone(),
            url: client.url.clone(),
        });

        self.clients.push(client.clone());
        client
    }

    /// Navigate a window. Only the controlling worker may do this.
    pub fn navigate(&mut self, id: &str, url: Url, worker: ServiceWorkerId) -> Result<Client> {
        let client = self
            .clients
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;

        if !client.is_window() {
            return Err(ServiceWorkerError::Client(
                "Can only navigate window clients".to_string(),
            ));
        }
        if client.controller != Some(worker) {
            return Err(ServiceWorkerError::Client(format!(
                "client {} is not controlled by this worker",
                id
            )));
        }

        client.url = url;
        let navigated = client.clone();

        self.emit(HostEvent::ClientNavigated {
            client_id: navigated.id.clone(),
            url: navigated.url.clone(),
        });
        Ok(navigated)
    }

    /// Focus a window, unfocusing every other client.
    pub fn focus(&mut self, id: &str) -> Result<Client> {
        let target = self
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;
        if !target.is_window() {
            return Err(ServiceWorkerError::Client(
                "Can only focus window clients".to_string(),
            ));
        }

        for client in &mut self.clients {
            client.focused = client.id == id;
            if client.focused {
                client.visibility_state = VisibilityState::Visible;
            }
        }

        self.emit(HostEvent::ClientFocused {
            client_id: id.to_string(),
        });
        self.get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))
    }

    /// Make `worker` the controller of every client inside `scope`.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> usize {
        let mut claimed = 0;
        for client in &mut self.clients {
            if client.url.as_str().starts_with(scope.as_str()) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }

        self.emit(HostEvent::ClientsClaimed {
            worker_id: worker,
            count: claimed,
        });
        claimed
    }
}

// ==================== Helpers ====================

/// Generate a simple UUID-like string.
fn uuid_simple() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "{:016x}-{:04x}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
