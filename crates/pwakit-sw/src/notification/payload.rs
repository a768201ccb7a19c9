//! Notification payloads and the defaults applied to them.
//!
//! Payload fields follow "falsy means absent": an empty string, `0`,
//! `false` or `null` is treated like a missing key and the configured
//! default takes its place. Any other value is turned into text the way a
//! page script would: `1.0` reads `1`, `true` reads `true`, arrays are
//! joined with commas and objects read `[object Object]`.

use std::str::Utf8Error;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use super::is_truthy;
use crate::config::NotificationDefaults;
use crate::{Result, ServiceWorkerError};

/// Which input produced a notification. Selects body and tag defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSource {
    /// `SHOW_NOTIFICATION` from a page.
    Message,
    /// A push event.
    Push,
}

/// How a push blob was understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecoding {
    /// Valid JSON.
    Structured,
    /// UTF-8 text, used as the body.
    Text,
    /// Nothing usable; every field takes its default.
    Empty,
}

/// Caller-supplied notification fields, before defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub data: Option<JsonValue>,
}

fn script_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => format!("{:.0}", f),
            _ => n.to_string(),
        },
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items.iter().map(script_string).collect::<Vec<_>>().join(","),
        JsonValue::Object(_) => "[object Object]".to_string(),
    }
}

fn text_field(object: &Map<String, JsonValue>, key: &str) -> Option<String> {
    object.get(key).filter(|v| is_truthy(v)).map(script_string)
}

impl NotificationPayload {
    /// Read fields from a JSON value. Anything but an object yields an
    /// empty payload.
    pub fn from_value(value: &JsonValue) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        Self {
            title: text_field(object, "title"),
            body: text_field(object, "body"),
            icon: text_field(object, "icon"),
            badge: text_field(object, "badge"),
            tag: text_field(object, "tag"),
            data: object.get("data").filter(|v| is_truthy(v)).cloned(),
        }
    }

    /// A payload carrying only `text` as its body.
    pub fn from_text(text: &str) -> Self {
        Self {
            body: (!text.is_empty()).then(|| text.to_string()),
            ..Default::default()
        }
    }

    fn decode_structured(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        Ok(Self::from_value(&value))
    }

    fn decode_text(bytes: &[u8]) -> std::result::Result<Self, Utf8Error> {
        std::str::from_utf8(bytes).map(Self::from_text)
    }

    /// Decode a push blob: JSON, then UTF-8 text, then nothing.
    pub fn decode_push(data: Option<&[u8]>) -> (Self, PushDecoding) {
        let Some(bytes) = data else {
            return (Self::default(), PushDecoding::Empty);
        };

        match Self::decode_structured(bytes) {
            Ok(payload) => return (payload, PushDecoding::Structured),
            Err(e) => debug!(error = %e, "Push payload is not JSON"),
        }

        match Self::decode_text(bytes) {
            Ok(payload) => (payload, PushDecoding::Text),
            Err(e) => {
                debug!(error = %e, "Push payload is not text");
                (Self::default(), PushDecoding::Empty)
            }
        }
    }

    /// Fill absent fields from `defaults` for the given source.
    pub fn into_request(
        self,
        source: NotificationSource,
        defaults: &NotificationDefaults,
    ) -> NotificationRequest {
        let (body, tag) = match source {
            NotificationSource::Message => (&defaults.message_body, &defaults.message_tag),
            NotificationSource::Push => (&defaults.push_body, &defaults.push_tag),
        };

        NotificationRequest {
            title: self.title.unwrap_or_else(|| defaults.app_name.clone()),
            options: NotificationOptions {
                body: self.body.unwrap_or_else(|| body.clone()),
                icon: self.icon.unwrap_or_else(|| defaults.icon.clone()),
                badge: self.badge.unwrap_or_else(|| defaults.badge.clone()),
                tag: self.tag.unwrap_or_else(|| tag.clone()),
                renotify: true,
                data: self.data.unwrap_or_else(|| json!({ "url": defaults.url })),
            },
        }
    }
}

/// Display options of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    /// Alert again when replacing a notification with the same tag.
    pub renotify: bool,
    pub data: JsonValue,
}

/// A fully resolved request to display a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub title: String,
    pub options: NotificationOptions,
}

impl NotificationRequest {
    /// Reject option combinations a platform would refuse.
    pub fn validate(&self) -> Result<()> {
        if self.options.renotify && self.options.tag.is_empty() {
            return Err(ServiceWorkerError::Notification(
                "renotify requires a non-empty tag".to_string(),
            ));
        }
        Ok(())
    }
}
