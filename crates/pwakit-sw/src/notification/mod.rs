//! Notifications: page messages, push payloads, display and clicks.
//!
//! ```text
//! Message {type, payload} ──┐
//! Push (opaque bytes) ──────┼── NotificationPayload ── defaults ── NotificationPlatform::show
//!                           │
//! Click ────────────────────┴── close ── Clients (navigate + focus | open_window)
//! ```

use serde_json::Value as JsonValue;

mod dispatcher;
mod message;
mod payload;
mod tray;

pub use dispatcher::{NotificationClickEvent, NotificationDispatcher, PushEvent};
pub use message::{ClientMessage, LastNotificationSlot};
pub use payload::{
    NotificationOptions, NotificationPayload, NotificationRequest, NotificationSource,
    PushDecoding,
};
pub use tray::{Notification, NotificationId, NotificationPlatform, NotificationTray};

/// `false`, `0`, `""` and `null` count as absent.
pub(crate) fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}
