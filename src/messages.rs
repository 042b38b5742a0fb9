use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                $name(id)
            }
        }
    };
}

id_type!(RoomId);
id_type!(UserId);
id_type!(MessageId);

/// Identifies one live socket. A user may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Read,
}

/// A message before persistence: no id, no timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftMessage {
    pub sender_id: UserId,
    pub room_id: RoomId,
    pub content: String,
    /// Connection the frame arrived on, excluded from fan-out.
    pub origin: Option<ConnectionId>,
}

impl DraftMessage {
    pub fn new(sender_id: UserId, room_id: RoomId, content: impl Into<String>) -> Self {
        DraftMessage {
            sender_id,
            room_id,
            content: content.into(),
            origin: None,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// A persisted message as handed out by the message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub room_id: RoomId,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageQuery {
    #[serde(default = "PageQuery::default_per_page")]
    pub per_page: u32,
    #[serde(default = "PageQuery::default_page")]
    pub page: u32,
    /// Newest first unless explicitly disabled.
    #[serde(default = "PageQuery::default_reverse")]
    pub reverse: bool,
}

impl PageQuery {
    fn default_per_page() -> u32 {
        50
    }

    fn default_page() -> u32 {
        1
    }

    fn default_reverse() -> bool {
        true
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub active_rooms: usize,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn message_serializes_with_snake_case_fields() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let message = Message {
            id: MessageId(3),
            sender_id: UserId(1),
            room_id: RoomId(7),
            content: "hi".to_string(),
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            is_active: true,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["sender_id"], 1);
        assert_eq!(json["room_id"], 7);
        assert_eq!(json["status"], "sent");
        assert!(json["deleted_at"].is_null());
        assert_eq!(json["created_at"], "2024-05-01T12:30:00Z");
    }

    #[test]
    fn page_query_defaults() {
        let query: PageQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.per_page, 50);
        assert_eq!(query.page, 1);
        assert!(query.reverse);
    }
}
