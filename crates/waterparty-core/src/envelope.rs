//! The `{Event, Payload, Token}` wire envelope and its typed decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;
use crate::ids::{RoomId, UserId};
use crate::models::{
    ChatMessage, DeleteUserRequest, DirectMessageRequest, ErrorPayload, RoomRequest,
};

/// Event names understood by the hub, plus the responses it emits.
pub mod events {
    pub const JOIN_ROOM: &str = "JOIN_ROOM";
    pub const LEAVE_ROOM: &str = "LEAVE_ROOM";
    pub const SEND_MESSAGE: &str = "SEND_MESSAGE";
    pub const SEND_DM: &str = "SEND_DM";
    pub const DELETE_USER: &str = "DELETE_USER";

    pub const NEW_MESSAGE: &str = "NEW_MESSAGE";
    pub const USER_DELETED: &str = "USER_DELETED";
    pub const ERROR: &str = "ERROR";
}

/// One application message. Several may share a physical frame, separated
/// by newlines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Event", default)]
    pub event: String,
    #[serde(rename = "Payload", default)]
    pub payload: Value,
    #[serde(rename = "Token", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: &impl Serialize) -> Result<Self, EnvelopeError> {
        Ok(Self {
            event: event.into(),
            payload: serde_json::to_value(payload)?,
            token: None,
        })
    }

    pub fn from_value(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            token: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            message: message.into(),
        };
        Self::from_value(events::ERROR, serde_json::to_value(payload).unwrap_or_default())
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize to the text carried by one frame.
    pub fn to_frame(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An inbound envelope resolved to the action it asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// `None` when the payload carried no usable room id.
    JoinRoom { room_id: Option<RoomId> },
    LeaveRoom { room_id: Option<RoomId> },
    SendMessage(ChatMessage),
    SendDirect {
        recipient_id: Option<UserId>,
        content: String,
    },
    DeleteUser { user_id: Option<UserId> },
    /// Anything the hub does not route itself; handed to the backend as-is.
    Unrecognized(Envelope),
}

impl InboundEvent {
    pub fn from_envelope(envelope: Envelope) -> Result<Self, EnvelopeError> {
        if envelope.event.is_empty() {
            return Err(EnvelopeError::MissingEvent);
        }

        let event = match envelope.event.as_str() {
            events::JOIN_ROOM => {
                let req: RoomRequest = payload_as(&envelope)?;
                Self::JoinRoom {
                    room_id: non_empty(req.room_id).map(RoomId::from_raw),
                }
            }
            events::LEAVE_ROOM => {
                let req: RoomRequest = payload_as(&envelope)?;
                Self::LeaveRoom {
                    room_id: non_empty(req.room_id).map(RoomId::from_raw),
                }
            }
            events::SEND_MESSAGE => Self::SendMessage(payload_as(&envelope)?),
            events::SEND_DM => {
                let req: DirectMessageRequest = payload_as(&envelope)?;
                Self::SendDirect {
                    recipient_id: non_empty(req.recipient_id).map(UserId::from_raw),
                    content: req.content,
                }
            }
            events::DELETE_USER => {
                let req: DeleteUserRequest = payload_as(&envelope)?;
                Self::DeleteUser {
                    user_id: non_empty(req.user_id).map(UserId::from_raw),
                }
            }
            _ => Self::Unrecognized(envelope),
        };
        Ok(event)
    }

    /// Decode a raw frame straight to a typed event.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        Self::from_envelope(Envelope::decode(raw)?)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::JoinRoom { .. } => events::JOIN_ROOM,
            Self::LeaveRoom { .. } => events::LEAVE_ROOM,
            Self::SendMessage(_) => events::SEND_MESSAGE,
            Self::SendDirect { .. } => events::SEND_DM,
            Self::DeleteUser { .. } => events::DELETE_USER,
            Self::Unrecognized(env) => &env.event,
        }
    }
}

/// A null or absent payload decodes to the type's default.
fn payload_as<T: DeserializeOwned + Default>(envelope: &Envelope) -> Result<T, EnvelopeError> {
    if envelope.payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| EnvelopeError::invalid_payload(&envelope.event, e))
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
