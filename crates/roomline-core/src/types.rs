use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque server-issued position marker in the global event feed.
///
/// Cursors are only ever compared for identity and replaced wholesale;
/// their contents carry no client-visible structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(token: &str) -> Self {
        Self(token.to_owned())
    }
}

impl From<String> for Cursor {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Opaque room event as delivered by delta fetches and pagination.
///
/// The engine orders and forwards events; it never interprets `content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event type tag, for example `m.room.message`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sender user ID.
    #[serde(default)]
    pub sender: String,
    /// State key; present for state events, absent for message events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Event ID when the server reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Origin server timestamp in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<u64>,
    /// Opaque content payload.
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Event {
    /// Whether this event carries state semantics.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

/// Result of one synchronization cycle.
///
/// For every room present, `events` is oldest-first and, when the server
/// flagged a history gap, gap-free between the previous cursor and
/// `next_batch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncBatch {
    /// Cursor the cycle started from; `None` for an initial full sync.
    pub since: Option<Cursor>,
    /// Cursor to resume from.
    pub next_batch: Cursor,
    /// Ordered events per room.
    pub events: BTreeMap<String, Vec<Event>>,
}

impl SyncBatch {
    /// Whether the batch carries no room events at all.
    pub fn is_empty(&self) -> bool {
        self.events.values().all(|events| events.is_empty())
    }
}
