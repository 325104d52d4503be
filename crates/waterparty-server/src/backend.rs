//! In-process backend: chat history and account deletion kept in memory.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use waterparty_core::models::ChatMessage;
use waterparty_core::{BackendError, Envelope, RoomId, UserId};
use waterparty_hub::{Delivery, EventBackend};

pub const GET_CHAT_HISTORY: &str = "GET_CHAT_HISTORY";
pub const CHAT_HISTORY: &str = "CHAT_HISTORY";

/// Messages returned per history request, newest last.
pub const HISTORY_LIMIT: usize = 50;

/// Messages kept per chat unless configured otherwise.
pub const DEFAULT_HISTORY_RETENTION: usize = 1000;

#[derive(Debug, Default, Deserialize)]
struct HistoryRequest {
    #[serde(rename = "ChatID", default)]
    chat_id: String,
}

pub struct InMemoryBackend {
    messages: DashMap<RoomId, VecDeque<ChatMessage>>,
    deleted: DashSet<UserId>,
    retention: usize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_retention(DEFAULT_HISTORY_RETENTION)
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` messages per chat, never fewer than one
    /// history page.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            messages: DashMap::new(),
            deleted: DashSet::new(),
            retention: retention.max(HISTORY_LIMIT),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Number of messages currently stored for a chat.
    pub fn stored_len(&self, chat_id: &RoomId) -> usize {
        self.messages.get(chat_id).map_or(0, |msgs| msgs.len())
    }

    /// The most recent messages of a chat, oldest first.
    pub fn history(&self, chat_id: &RoomId, limit: usize) -> Vec<ChatMessage> {
        self.messages
            .get(chat_id)
            .map(|msgs| {
                let skip = msgs.len().saturating_sub(limit);
                msgs.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn is_deleted(&self, user_id: &UserId) -> bool {
        self.deleted.contains(user_id)
    }
}

#[async_trait]
impl EventBackend for InMemoryBackend {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), BackendError> {
        if self.deleted.contains(&message.sender_id) {
            return Err(BackendError::Unauthorized(format!(
                "user {} has been deleted",
                message.sender_id
            )));
        }
        let mut msgs = self.messages.entry(message.chat_id.clone()).or_default();
        msgs.push_back(message.clone());
        while msgs.len() > self.retention {
            let _ = msgs.pop_front();
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: &UserId) -> Result<(), BackendError> {
        if !self.deleted.insert(user_id.clone()) {
            return Err(BackendError::NotFound(format!("user {user_id}")));
        }
        debug!(user_id = %user_id, "user deleted");
        Ok(())
    }

    async fn handle_event(
        &self,
        _sender: &UserId,
        envelope: &Envelope,
    ) -> Result<Vec<Delivery>, BackendError> {
        if envelope.event != GET_CHAT_HISTORY {
            return Err(BackendError::Unsupported(envelope.event.clone()));
        }

        let req: HistoryRequest = if envelope.payload.is_null() {
            HistoryRequest::default()
        } else {
            serde_json::from_value(envelope.payload.clone())
                .map_err(|e| BackendError::InvalidRequest(e.to_string()))?
        };
        if req.chat_id.is_empty() {
            return Err(BackendError::InvalidRequest("ChatID is required".into()));
        }

        let chat_id = RoomId::from_raw(req.chat_id);
        let messages = self.history(&chat_id, HISTORY_LIMIT);
        let reply = Envelope::from_value(
            CHAT_HISTORY,
            json!({ "ChatID": chat_id, "Messages": messages }),
        );
        Ok(vec![Delivery::Sender(reply)])
    }
}
