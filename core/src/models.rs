//! Data models for Mallu

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type UserId = i64;
pub type MessageId = i64;
pub type CallId = i64;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Voice,
    CallEvent,
    #[serde(other)]
    Other,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Text
    }
}

/// Quoted parent message as the server embeds it in replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: MessageId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    /// Display name of the parent message's author.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server id; `None` while an optimistic send is in flight.
    #[serde(default)]
    pub id: Option<MessageId>,
    pub sender: UserId,
    pub receiver: UserId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub parent_message: Option<MessageId>,
    #[serde(default)]
    pub reply_to: Option<ReplyPreview>,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    /// Client-side key of an optimistic entry, never sent to the server.
    #[serde(skip)]
    pub local_key: Option<u64>,
}

impl ChatMessage {
    /// Content-only entry appended while the send request is in flight.
    pub fn pending(
        local_key: u64,
        sender: UserId,
        receiver: UserId,
        content: &str,
        parent_message: Option<MessageId>,
    ) -> Self {
        Self {
            id: None,
            sender,
            receiver,
            content: content.to_string(),
            message_type: MessageType::Text,
            parent_message,
            reply_to: None,
            timestamp: Utc::now(),
            is_read: false,
            local_key: Some(local_key),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.sender == user_id || self.receiver == user_id
    }

    /// The message this one replies to. Pushed copies only carry the
    /// `reply_to` preview.
    pub fn parent_id(&self) -> Option<MessageId> {
        self.parent_message
            .or_else(|| self.reply_to.as_ref().map(|r| r.id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest {
    pub receiver: UserId,
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message: Option<MessageId>,
}

// ============================================================================
// Presence
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartnerStatus {
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default, with = "timestamp::option")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PartnerStatus {
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        if self.is_typing {
            return "typing...".to_string();
        }
        if self.is_online {
            return "Online".to_string();
        }
        match self.last_seen {
            None => "Offline".to_string(),
            Some(seen) => {
                let minutes = (now - seen).num_minutes();
                if minutes < 60 {
                    format!("{}m ago", minutes.max(0))
                } else {
                    "offline".to_string()
                }
            }
        }
    }
}

/// Result of a history fetch. `partner_status` is absent when the server
/// answered with a bare message array.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    pub messages: Vec<ChatMessage>,
    pub partner_status: Option<PartnerStatus>,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum HistoryResponse {
    Bare(Vec<ChatMessage>),
    Full {
        messages: Vec<ChatMessage>,
        #[serde(default)]
        partner_status: Option<PartnerStatus>,
    },
}

impl From<HistoryResponse> for ConversationHistory {
    fn from(resp: HistoryResponse) -> Self {
        match resp {
            HistoryResponse::Bare(messages) => Self {
                messages,
                partner_status: None,
            },
            HistoryResponse::Full {
                messages,
                partner_status,
            } => Self {
                messages,
                partner_status,
            },
        }
    }
}

// ============================================================================
// Profile
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartnerProfile {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

// ============================================================================
// Safety
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportReason {
    FakeProfile,
    Harassment,
    Abuse,
    Scam,
    Inappropriate,
    Other,
}

impl std::str::FromStr for ReportReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fake_profile" => Ok(Self::FakeProfile),
            "harassment" => Ok(Self::Harassment),
            "abuse" => Ok(Self::Abuse),
            "scam" => Ok(Self::Scam),
            "inappropriate" => Ok(Self::Inappropriate),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown report reason: {}", other)),
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Active,
    Ended,
    Rejected,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub caller: UserId,
    pub receiver: UserId,
    pub status: CallStatus,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Answer of the call poll endpoint; any subset of the fields may be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallPoll {
    /// Unanswered call addressed to the current user.
    #[serde(default)]
    pub incoming: Option<CallRecord>,
    /// Latest update of a call the current user placed.
    #[serde(default)]
    pub my_call: Option<CallRecord>,
    /// Terminal status of a call the current user received.
    #[serde(default)]
    pub incoming_update: Option<CallRecord>,
}

// ============================================================================
// Serde helpers
// ============================================================================

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Server timestamps arrive either as RFC 3339 (REST) or in Python's
/// `str(datetime)` form (`2024-05-01 10:00:00.123456+00:00`, push stream).
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {}", raw))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_accepts_bare_array_and_envelope() {
        let bare = json!([{
            "id": 1, "sender": 2, "receiver": 3, "content": "hi",
            "message_type": "text", "timestamp": "2024-05-01T10:00:00Z", "is_read": false
        }]);
        let history: ConversationHistory =
            serde_json::from_value::<HistoryResponse>(bare).unwrap().into();
        assert_eq!(history.messages.len(), 1);
        assert!(history.partner_status.is_none());

        let full = json!({
            "messages": [],
            "partner_status": { "is_online": true, "is_typing": true, "last_seen": null }
        });
        let history: ConversationHistory =
            serde_json::from_value::<HistoryResponse>(full).unwrap().into();
        let status = history.partner_status.unwrap();
        assert!(status.is_online);
        assert!(status.is_typing);
        assert!(status.last_seen.is_none());
    }

    #[test]
    fn test_push_timestamp_format() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "id": 9, "sender": 2, "receiver": 3, "content": null,
            "timestamp": "2024-05-01 10:00:00.250000+00:00",
            "message_type": "voice", "is_me": false, "reply_to": null
        }))
        .unwrap();
        assert_eq!(msg.content, "");
        assert_eq!(msg.message_type, MessageType::Voice);
        assert_eq!(msg.timestamp.timestamp_millis() % 1000, 250);
    }

    #[test]
    fn test_unknown_message_type() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "sender": 2, "receiver": 3, "timestamp": "2024-05-01T10:00:00+00:00",
            "message_type": "sticker"
        }))
        .unwrap();
        assert_eq!(msg.message_type, MessageType::Other);
        assert!(msg.is_pending());
    }

    #[test]
    fn test_partner_status_description() {
        let now = Utc::now();
        let mut status = PartnerStatus::default();
        assert_eq!(status.describe(now), "Offline");

        status.last_seen = Some(now - chrono::Duration::minutes(5));
        assert_eq!(status.describe(now), "5m ago");

        status.last_seen = Some(now - chrono::Duration::hours(3));
        assert_eq!(status.describe(now), "offline");

        status.is_typing = true;
        assert_eq!(status.describe(now), "typing...");
    }

    #[test]
    fn test_call_poll_partial() {
        let poll: CallPoll = serde_json::from_value(json!({
            "my_call": {
                "id": 4, "caller": 1, "receiver": 2, "status": "rejected",
                "caller_name": "Anu", "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:00:05Z", "sdp_offer": null
            }
        }))
        .unwrap();
        assert!(poll.incoming.is_none());
        assert!(poll.my_call.unwrap().status.is_terminal());
    }
}
