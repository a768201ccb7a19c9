//! Messages pages post to the worker.

use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::is_truthy;

/// A recognized page message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Remember the payload of the latest notification the page scheduled.
    StoreLastNotification(Option<JsonValue>),
    /// Display a notification now.
    ShowNotification(Option<JsonValue>),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    payload: Option<JsonValue>,
}

impl ClientMessage {
    /// Recognize a message. Non-objects and unknown types yield `None`.
    pub fn parse(value: &JsonValue) -> Option<Self> {
        let raw: RawMessage = serde_json::from_value(value.clone()).ok()?;
        match raw.kind.as_deref()? {
            "STORE_LAST_NOTIFICATION" => Some(ClientMessage::StoreLastNotification(raw.payload)),
            "SHOW_NOTIFICATION" => Some(ClientMessage::ShowNotification(raw.payload)),
            _ => None,
        }
    }
}

/// The most recent payload a page asked the worker to remember.
///
/// Lives only as long as the worker process; a restarted worker starts
/// empty, so readers must treat `None` as "unknown", not "never set".
#[derive(Debug, Default)]
pub struct LastNotificationSlot {
    slot: Mutex<Option<JsonValue>>,
}

impl LastNotificationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored payload. A falsy payload clears the slot.
    pub fn store(&self, payload: Option<JsonValue>) {
        let payload = payload.filter(is_truthy);
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = payload;
    }

    pub fn get(&self) -> Option<JsonValue> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.store(None);
    }
}
