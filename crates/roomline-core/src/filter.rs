//! Serializable sync/pagination filters.
//!
//! Filters are immutable descriptions of which rooms, event types and
//! limits the server should apply to a delta fetch. They travel as compact
//! JSON inside a query parameter.

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ErrorCategory};

/// Top-level filter applied to a delta fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<EventTypeFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomFilter>,
}

/// Room-scoped filter portion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomFilter {
    /// Restrict the delta to these room IDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EventTypeFilter>,
}

/// Timeline portion of a room filter; also reused for pagination calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_senders: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lazy_load_members: Option<bool>,
}

/// Plain include/exclude filter for event types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventTypeFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_types: Option<Vec<String>>,
}

impl EventTypeFilter {
    /// A filter excluding every event type.
    pub fn exclude_all() -> Self {
        Self {
            types: None,
            not_types: Some(vec!["*".to_owned()]),
        }
    }
}

impl Filter {
    /// Encode the filter as the compact JSON the server expects in a
    /// query string.
    pub fn encode(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|err| {
            ClientError::new(
                ErrorCategory::Serialization,
                "filter_encode_error",
                err.to_string(),
            )
        })
    }

    /// The timeline portion, used as the pagination filter for catch-up.
    pub fn timeline(&self) -> Option<&TimelineFilter> {
        self.room.as_ref()?.timeline.as_ref()
    }
}

impl TimelineFilter {
    pub fn encode(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|err| {
            ClientError::new(
                ErrorCategory::Serialization,
                "filter_encode_error",
                err.to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_compact_json_without_absent_fields() {
        let filter = Filter {
            account_data: Some(EventTypeFilter::exclude_all()),
            room: Some(RoomFilter {
                rooms: None,
                timeline: Some(TimelineFilter {
                    limit: Some(1000),
                    lazy_load_members: Some(true),
                    not_senders: Some(vec!["@me:example.org".to_owned()]),
                    ..TimelineFilter::default()
                }),
                ephemeral: Some(EventTypeFilter::exclude_all()),
            }),
        };

        let encoded = filter.encode().expect("filter should encode");
        assert!(encoded.contains("\"not_types\":[\"*\"]"));
        assert!(encoded.contains("\"limit\":1000"));
        assert!(encoded.contains("\"lazy_load_members\":true"));
        assert!(!encoded.contains("types\":null"));
        assert!(!encoded.contains("\"rooms\""));
    }

    #[test]
    fn default_filter_encodes_to_empty_object() {
        assert_eq!(Filter::default().encode().expect("encode"), "{}");
    }

    #[test]
    fn exposes_timeline_portion_for_pagination() {
        let filter = Filter {
            account_data: None,
            room: Some(RoomFilter {
                timeline: Some(TimelineFilter {
                    limit: Some(64),
                    ..TimelineFilter::default()
                }),
                ..RoomFilter::default()
            }),
        };

        assert_eq!(filter.timeline().and_then(|t| t.limit), Some(64));
        assert!(Filter::default().timeline().is_none());
    }
}
