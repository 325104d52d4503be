//! Payload shapes carried inside envelopes.
//!
//! Field names follow the mobile client's PascalCase wire format.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{MessageId, RoomId, UserId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    System,
    #[serde(rename = "AI")]
    Wingman,
    Payment,
}

/// A chat message as broadcast in `NEW_MESSAGE` envelopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    #[serde(rename = "ID", deserialize_with = "lenient")]
    pub id: MessageId,
    #[serde(rename = "ChatID")]
    pub chat_id: RoomId,
    #[serde(rename = "SenderID", deserialize_with = "lenient")]
    pub sender_id: UserId,
    #[serde(rename = "Type", deserialize_with = "lenient")]
    pub kind: MessageType,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "MediaURL")]
    pub media_url: String,
    #[serde(rename = "ThumbnailURL")]
    pub thumbnail_url: String,
    #[serde(rename = "Metadata")]
    pub metadata: serde_json::Value,
    #[serde(rename = "ReplyToID")]
    pub reply_to_id: String,
    #[serde(rename = "CreatedAt", deserialize_with = "lenient")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "SenderName")]
    pub sender_name: String,
    #[serde(rename = "SenderThumbnail")]
    pub sender_thumbnail: String,
}

/// Decode `T`, falling back to its default when the value does not fit.
/// Used for fields the server overwrites or that a newer client may extend.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

impl Default for ChatMessage {
    fn default() -> Self {
        Self {
            id: MessageId::from_raw(""),
            chat_id: RoomId::from_raw(""),
            sender_id: UserId::from_raw(""),
            kind: MessageType::Text,
            content: String::new(),
            media_url: String::new(),
            thumbnail_url: String::new(),
            metadata: serde_json::Value::Null,
            reply_to_id: String::new(),
            created_at: DateTime::<Utc>::default(),
            sender_name: String::new(),
            sender_thumbnail: String::new(),
        }
    }
}

impl ChatMessage {
    /// Stamp a client-supplied draft with server-side identity: fresh id,
    /// the authenticated sender, and the current time.
    pub fn stamped(mut self, sender: &UserId) -> Self {
        self.id = MessageId::new();
        self.sender_id = sender.clone();
        self.created_at = Utc::now();
        self
    }

    pub fn direct(sender: &UserId, recipient: &UserId, content: String) -> Self {
        Self {
            chat_id: RoomId::direct(sender, recipient),
            kind: MessageType::Text,
            content,
            ..Self::default()
        }
        .stamped(sender)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    #[serde(rename = "RoomID", default)]
    pub room_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessageRequest {
    #[serde(rename = "RecipientID", default)]
    pub recipient_id: String,
    #[serde(rename = "Content", default)]
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUserRequest {
    #[serde(rename = "UserID", default)]
    pub user_id: String,
}

/// Body of `ERROR` envelopes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}
