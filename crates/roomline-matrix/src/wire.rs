//! Wire-level request/response shapes for the client-server API.

use std::collections::BTreeMap;

use roomline_core::{Cursor, Event, TimelineFilter};
use serde::Deserialize;

/// Response of one delta fetch (`GET /sync`).
#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub next_batch: Cursor,
    #[serde(default)]
    pub rooms: RoomsSection,
}

/// Per-membership room sections of a delta fetch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomsSection {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoomDelta>,
}

/// Delta reported for one joined room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoomDelta {
    #[serde(default)]
    pub timeline: TimelineDelta,
}

/// Timeline portion of a joined-room delta.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineDelta {
    #[serde(default)]
    pub events: Vec<Event>,
    /// Set when the delta was truncated and a history gap exists.
    #[serde(default)]
    pub limited: bool,
    /// Pagination token pointing just before the first delta event.
    #[serde(default)]
    pub prev_batch: Option<Cursor>,
}

/// Movement direction for pagination calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

/// Query options for one pagination call (`GET /rooms/{id}/messages`).
#[derive(Debug, Clone, PartialEq)]
pub struct MessagesOptions {
    pub dir: Direction,
    pub from: Option<Cursor>,
    pub to: Option<Cursor>,
    pub filter: Option<TimelineFilter>,
    pub limit: Option<u32>,
}

impl MessagesOptions {
    /// Backward pagination from `from`, stopping at `to`.
    pub fn backward(from: Option<Cursor>, to: Option<Cursor>) -> Self {
        Self {
            dir: Direction::Backward,
            from,
            to,
            filter: None,
            limit: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<TimelineFilter>) -> Self {
        self.filter = filter;
        self
    }
}

/// One page of pagination results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesPage {
    #[serde(default)]
    pub chunk: Vec<Event>,
    #[serde(default)]
    pub start: Option<Cursor>,
    /// Token for the next page; absent when history is exhausted.
    #[serde(default)]
    pub end: Option<Cursor>,
}

/// Response of a message/state event send.
#[derive(Debug, Clone, Deserialize)]
pub struct SendEventResponse {
    pub event_id: String,
}

/// Response of a room join.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinResponse {
    pub room_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoomsResponse {
    #[serde(default)]
    pub joined_rooms: Vec<String>,
}

/// Member state events of a room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MembersResponse {
    #[serde(default)]
    pub chunk: Vec<Event>,
}

/// Response of a password login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in_ms: Option<u64>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub home_server: Option<String>,
}

/// Response of a token refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in_ms: Option<u64>,
}

/// `.well-known/matrix/client` discovery document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WellKnownClient {
    #[serde(rename = "m.homeserver", default)]
    pub homeserver: Option<HomeserverInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeserverInfo {
    pub base_url: String,
}

/// Supported specification versions of a homeserver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionsResponse {
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub unstable_features: BTreeMap<String, bool>,
}

/// Standard error body returned by the server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub errcode: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub soft_logout: bool,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}
