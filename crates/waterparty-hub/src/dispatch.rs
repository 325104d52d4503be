//! Inbound envelope routing.
//!
//! Room membership, chat messages, direct messages and account deletion are
//! handled here. Every other event is handed to the [`EventBackend`], whose
//! returned [`Delivery`] list is applied through the hub.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument, warn};
use waterparty_core::envelope::events;
use waterparty_core::models::ChatMessage;
use waterparty_core::{BackendError, Envelope, InboundEvent, RoomId, UserId};

use crate::client::ClientHandle;
use crate::service::HubHandle;

/// Where a backend response should go.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// Back to the connection that sent the event.
    Sender(Envelope),
    User(UserId, Envelope),
    Room(RoomId, Envelope),
    Global(Envelope),
}

/// Business collaborator behind the hub: persistence plus any event the
/// hub does not route itself.
#[async_trait]
pub trait EventBackend: Send + Sync {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), BackendError>;

    async fn delete_user(&self, user_id: &UserId) -> Result<(), BackendError>;

    async fn handle_event(
        &self,
        sender: &UserId,
        envelope: &Envelope,
    ) -> Result<Vec<Delivery>, BackendError> {
        let _ = sender;
        Err(BackendError::Unsupported(envelope.event.clone()))
    }
}

/// Routes decoded inbound events for every connection.
pub struct Dispatcher {
    hub: HubHandle,
    backend: Arc<dyn EventBackend>,
}

impl Dispatcher {
    pub fn new(hub: HubHandle, backend: Arc<dyn EventBackend>) -> Self {
        Self { hub, backend }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Decode one inbound text frame and act on it. Malformed frames are
    /// dropped.
    pub async fn dispatch_frame(&self, client: &ClientHandle, raw: &str) {
        match InboundEvent::parse(raw) {
            Ok(event) => self.dispatch(client, event).await,
            Err(e) => {
                debug!(user_id = %client.user_id(), error = %e, "dropping malformed frame");
                self.count_dropped("malformed");
            }
        }
    }

    #[instrument(skip_all, fields(event = event.name(), user_id = %client.user_id()))]
    pub async fn dispatch(&self, client: &ClientHandle, event: InboundEvent) {
        match event {
            InboundEvent::JoinRoom { room_id: Some(room_id) } => {
                let _ = self.hub.join_room(&room_id, client);
            }
            InboundEvent::LeaveRoom { room_id: Some(room_id) } => {
                let _ = self.hub.leave_room(&room_id, client);
            }
            InboundEvent::JoinRoom { room_id: None }
            | InboundEvent::LeaveRoom { room_id: None } => {
                debug!("room event without room id ignored");
            }
            InboundEvent::SendMessage(draft) => self.send_message(client, draft),
            InboundEvent::SendDirect {
                recipient_id: Some(recipient),
                content,
            } => self.send_direct(client, &recipient, content),
            InboundEvent::SendDirect { recipient_id: None, .. } => {
                debug!("direct message without recipient ignored");
            }
            InboundEvent::DeleteUser { user_id } => self.delete_user(client, user_id).await,
            InboundEvent::Unrecognized(envelope) => self.forward(client, envelope).await,
        }
    }

    fn send_message(&self, client: &ClientHandle, draft: ChatMessage) {
        if draft.chat_id.is_empty() {
            debug!("chat message without chat id ignored");
            return;
        }
        let message = draft.stamped(client.user_id());
        self.persist(message.clone());

        if let Some(frame) = new_message_frame(&message) {
            let _ = self.hub.broadcast_to_room(&message.chat_id, frame);
        }
    }

    fn send_direct(&self, client: &ClientHandle, recipient: &UserId, content: String) {
        let message = ChatMessage::direct(client.user_id(), recipient, content);
        self.persist(message.clone());

        if let Some(frame) = new_message_frame(&message) {
            let _ = self.hub.send_to_user(recipient, Arc::clone(&frame));
            let _ = self.hub.send_to_client(client, frame);
        }
    }

    async fn delete_user(&self, client: &ClientHandle, target: Option<UserId>) {
        if target.as_ref() != Some(client.user_id()) {
            warn!(target = ?target, "rejected deletion of another account");
            self.reply(client, Envelope::error("Not authorized to delete this user"));
            return;
        }

        match self.backend.delete_user(client.user_id()).await {
            Ok(()) => {
                let done = Envelope::from_value(
                    events::USER_DELETED,
                    json!({ "UserID": client.user_id() }),
                );
                self.reply(client, done);
                self.hub.unregister(client).await;
            }
            Err(e) => {
                warn!(error = %e, "account deletion failed");
                self.reply(client, Envelope::error(format!("Failed to delete user: {e}")));
            }
        }
    }

    async fn forward(&self, client: &ClientHandle, envelope: Envelope) {
        match self.backend.handle_event(client.user_id(), &envelope).await {
            Ok(deliveries) => {
                for delivery in deliveries {
                    self.deliver(client, delivery);
                }
            }
            Err(e) if !e.is_reportable() => {
                debug!(error = %e, "event not handled");
                self.count_dropped("unsupported");
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "backend rejected event");
                self.reply(client, Envelope::error(e.to_string()));
            }
        }
    }

    fn deliver(&self, client: &ClientHandle, delivery: Delivery) {
        match delivery {
            Delivery::Sender(env) => self.reply(client, env),
            Delivery::User(user_id, env) => {
                if let Some(frame) = encode(&env) {
                    let _ = self.hub.send_to_user(&user_id, frame);
                }
            }
            Delivery::Room(room_id, env) => {
                if let Some(frame) = encode(&env) {
                    let _ = self.hub.broadcast_to_room(&room_id, frame);
                }
            }
            Delivery::Global(env) => {
                if let Some(frame) = encode(&env) {
                    let _ = self.hub.broadcast_global(frame);
                }
            }
        }
    }

    fn reply(&self, client: &ClientHandle, envelope: Envelope) {
        if let Some(frame) = encode(&envelope) {
            let _ = self.hub.send_to_client(client, frame);
        }
    }

    /// Fire-and-forget save on a separate task.
    fn persist(&self, message: ChatMessage) {
        let backend = Arc::clone(&self.backend);
        drop(tokio::spawn(async move {
            if let Err(e) = backend.save_message(&message).await {
                warn!(chat_id = %message.chat_id, error = %e, "failed to save message");
            }
        }));
    }

    fn count_dropped(&self, reason: &str) {
        if let Some(metrics) = self.hub.hub().metrics() {
            metrics.counter_inc("hub_inbound_dropped_total", &[("reason", reason)], 1);
        }
    }
}

fn new_message_frame(message: &ChatMessage) -> Option<Arc<str>> {
    match Envelope::new(events::NEW_MESSAGE, message) {
        Ok(env) => encode(&env),
        Err(e) => {
            warn!(error = %e, "failed to encode chat message");
            None
        }
    }
}

fn encode(envelope: &Envelope) -> Option<Arc<str>> {
    match envelope.to_frame() {
        Ok(frame) => Some(Arc::from(frame)),
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "failed to encode envelope");
            None
        }
    }
}
