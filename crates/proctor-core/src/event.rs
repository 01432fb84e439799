//! Client-submitted events.
//!
//! Exam clients stream log and ping events to the server; the indicator
//! engine derives per-connection values from them. Log text may carry a
//! leading `<tag>` prefix that groups related entries.

use serde::{Deserialize, Serialize};

/// Type of a client-submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    DebugLog,
    InfoLog,
    WarnLog,
    ErrorLog,
    Ping,
    Notification,
}

/// A single event submitted by an exam client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Client-assigned timestamp in milliseconds.
    pub client_time: i64,
    /// Server-side receive timestamp in milliseconds.
    pub server_time: i64,
    /// Numeric payload (battery percentage, ping number, ...).
    pub numeric_value: Option<f64>,
    pub text: String,
}

impl ClientEvent {
    pub fn new(
        event_type: EventType,
        client_time: i64,
        server_time: i64,
        numeric_value: Option<f64>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            client_time,
            server_time,
            numeric_value,
            text: text.into(),
        }
    }

    /// Extract the leading `<tag>` prefix of the event text, if any.
    ///
    /// Returns the tag without the angle brackets. Text that does not start
    /// with `<`, or has no closing `>`, is untagged.
    pub fn tag(&self) -> Option<&str> {
        let rest = self.text.strip_prefix('<')?;
        let close = rest.find('>')?;
        Some(&rest[..close])
    }
}
