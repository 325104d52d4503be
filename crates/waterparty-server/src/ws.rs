//! `GET /ws` admission: identity resolution, registration, and the axum
//! WebSocket adapter for the hub pumps.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::response::Response;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};
use waterparty_core::UserId;
use waterparty_hub::client;
use waterparty_hub::{serve_client, HubConfig, HubError, WireFrame};

use crate::server::AppState;

/// Transport message limit as a multiple of the hub's frame size. Frames
/// between the two are read and dropped by the hub; larger ones fail the
/// read and end the connection.
const TRANSPORT_LIMIT_FACTOR: usize = 16;

/// Identity attached to the request by upstream auth middleware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub uid: Option<String>,
}

/// Authenticated identity first, then the `uid` query parameter, then a
/// generated anonymous id.
pub fn resolve_user_id(auth: Option<&AuthenticatedUser>, uid: Option<&str>) -> UserId {
    if let Some(AuthenticatedUser(id)) = auth {
        if !id.is_empty() {
            return id.clone();
        }
    }
    match uid.map(str::trim) {
        Some(uid) if !uid.is_empty() => UserId::from_raw(uid),
        _ => UserId::anonymous(),
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    request: Request,
) -> Response {
    let user_id = resolve_user_id(
        request.extensions().get::<AuthenticatedUser>(),
        query.uid.as_deref(),
    );

    let limit = transport_message_limit(&state.hub_config);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

pub fn transport_message_limit(config: &HubConfig) -> usize {
    config.max_frame_size.saturating_mul(TRANSPORT_LIMIT_FACTOR)
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (client, mailbox) = client::channel(user_id, state.hub_config.mailbox_capacity);

    if let Err(e) = state.hub.register(client.clone()).await {
        warn!(user_id = %client.user_id(), error = %e, "rejecting connection");
        return;
    }
    info!(
        user_id = %client.user_id(),
        connection_id = %client.connection_id(),
        "websocket client connected"
    );

    let (sink, stream) = split_socket(socket);
    let session = state.sessions.spawn(serve_client(
        state.dispatcher.clone(),
        client.clone(),
        mailbox,
        sink,
        stream,
        state.hub_config.clone(),
    ));
    if let Err(e) = session.await {
        warn!(user_id = %client.user_id(), error = %e, "client session failed");
    }
}

/// Adapt an axum WebSocket to the hub's frame sink and stream.
fn split_socket(
    socket: WebSocket,
) -> (
    impl Sink<WireFrame, Error = HubError> + Send + Unpin + 'static,
    impl Stream<Item = Result<WireFrame, HubError>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(HubError::transport)
        .with(|frame: WireFrame| future::ready(Ok::<_, HubError>(to_message(frame))));
    let stream = stream.map(|msg| msg.map(from_message).map_err(HubError::transport));
    (sink, stream)
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
        WireFrame::Ping => Message::Ping(Bytes::new()),
        WireFrame::Pong => Message::Pong(Bytes::new()),
        WireFrame::Close => Message::Close(None),
    }
}

fn from_message(msg: Message) -> WireFrame {
    match msg {
        Message::Text(text) => WireFrame::Text(text.to_string()),
        Message::Binary(bytes) => WireFrame::Binary(bytes.to_vec()),
        Message::Ping(_) => WireFrame::Ping,
        Message::Pong(_) => WireFrame::Pong,
        Message::Close(_) => WireFrame::Close,
    }
}
