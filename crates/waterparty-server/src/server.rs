use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use waterparty_hub::{Dispatcher, EventBackend, Hub, HubConfig, HubHandle, HubService};
use waterparty_telemetry::{MetricSample, MetricsRecorder};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::health::{self, HealthResponse};
use crate::ws;

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub hub_config: HubConfig,
    pub start_time: Instant,
    /// Every upgraded client session, so shutdown can wait for close frames.
    pub sessions: TaskTracker,
}

impl AppState {
    pub fn new(hub: HubHandle, backend: Arc<dyn EventBackend>, hub_config: HubConfig) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(hub.clone(), backend)),
            hub,
            hub_config,
            start_time: Instant::now(),
            sessions: TaskTracker::new(),
        }
    }

    fn metrics(&self) -> Option<&Arc<MetricsRecorder>> {
        self.hub.hub().metrics()
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the hub control loop and the HTTP server.
///
/// Both stop when `shutdown` is cancelled; the returned handle owns their
/// tasks, including one that finishes once every client session has ended.
pub async fn start(
    config: ServerConfig,
    backend: Arc<dyn EventBackend>,
    metrics: Option<Arc<MetricsRecorder>>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, ServerError> {
    config.validate()?;

    let hub = Arc::new(match metrics {
        Some(metrics) => Hub::with_metrics(metrics),
        None => Hub::new(),
    });
    let (hub_handle, hub_task) = HubService::spawn(hub, config.hub.control_queue, shutdown.clone());

    let state = AppState::new(hub_handle.clone(), backend, config.hub.clone());
    let sessions = state.sessions.clone();
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    tracing::info!(%local_addr, "waterparty server started");

    let sessions_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let sessions = sessions.clone();
        async move {
            shutdown.cancelled().await;
            sessions.close();
            sessions.wait().await;
            tracing::info!("client sessions drained");
        }
    });

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "http server failed");
        }
        tracing::info!("http server stopped");
    });

    Ok(ServerHandle {
        local_addr,
        hub: hub_handle,
        sessions,
        tasks: vec![server_task, hub_task, sessions_task],
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    hub: HubHandle,
    sessions: TaskTracker,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn sessions(&self) -> &TaskTracker {
        &self.sessions
    }

    /// Background tasks, for a graceful shutdown to wait on.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        self.tasks
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let hub = state.hub.hub();
    Json(health::health_check(
        state.start_time,
        hub.client_count(),
        hub.room_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Json<Vec<MetricSample>> {
    Json(state.metrics().map(|m| m.snapshot()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message;
    use tower::ServiceExt;
    use waterparty_core::{RoomId, UserId};

    use crate::backend::InMemoryBackend;
    use crate::shutdown::ShutdownCoordinator;

    fn make_state(metrics: Option<Arc<MetricsRecorder>>) -> (AppState, CancellationToken) {
        let token = CancellationToken::new();
        let hub = Arc::new(match metrics {
            Some(m) => Hub::with_metrics(m),
            None => Hub::new(),
        });
        let (handle, _task) = HubService::spawn(hub, 16, token.clone());
        let state = AppState::new(handle, Arc::new(InMemoryBackend::new()), HubConfig::default());
        (state, token)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_hub_counts() {
        let (state, _token) = make_state(None);
        let (client, _mailbox) = waterparty_hub::client::channel(UserId::from_raw("u1"), 4);
        let _ = state.hub.register(client.clone()).await.unwrap();
        let _ = state.hub.join_room(&RoomId::from_raw("r"), &client);

        let (status, body) = get_json(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 1);
        assert_eq!(body["rooms"], 1);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn metrics_snapshot_served() {
        let metrics = Arc::new(MetricsRecorder::new());
        let (state, _token) = make_state(Some(Arc::clone(&metrics)));
        let (client, _mailbox) = waterparty_hub::client::channel(UserId::from_raw("u1"), 4);
        let _ = state.hub.register(client).await.unwrap();

        let (status, body) = get_json(build_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let samples = body.as_array().unwrap();
        assert!(samples
            .iter()
            .any(|s| s["name"] == "hub_clients_connected" && s["value"] == 1.0));
    }

    #[tokio::test]
    async fn metrics_empty_when_disabled() {
        let (state, _token) = make_state(None);
        let (status, body) = get_json(build_router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_rejected() {
        let (state, _token) = make_state(None);
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = build_router(state).oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (state, _token) = make_state(None);
        let (status, _) = get_json(build_router(state), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return text.to_string();
            }
        }
    }

    #[tokio::test]
    async fn end_to_end_room_chat_and_shutdown() {
        let token = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let handle = start(config, Arc::new(InMemoryBackend::new()), None, token.clone())
            .await
            .unwrap();
        let port = handle.port();
        assert!(port > 0);

        let url = |uid: &str| format!("ws://127.0.0.1:{port}/ws?uid={uid}");
        let (mut alice, _) = tokio_tungstenite::connect_async(url("alice")).await.unwrap();
        let (mut bob, _) = tokio_tungstenite::connect_async(url("bob")).await.unwrap();

        let join = r#"{"Event":"JOIN_ROOM","Payload":{"RoomID":"party-1"}}"#;
        alice.send(Message::Text(join.into())).await.unwrap();
        bob.send(Message::Text(join.into())).await.unwrap();

        let hub = handle.hub().hub().clone();
        let room = RoomId::from_raw("party-1");
        wait_for(|| hub.room_members(&room).len() == 2).await;

        let health: Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["connections"], 2);
        assert_eq!(health["rooms"], 1);

        let send = r#"{"Event":"SEND_MESSAGE","Payload":{"ChatID":"party-1","Content":"hello"}}"#;
        alice.send(Message::Text(send.into())).await.unwrap();

        let received = next_text(&mut bob).await;
        let env: Value = serde_json::from_str(received.split('\n').next().unwrap()).unwrap();
        assert_eq!(env["Event"], "NEW_MESSAGE");
        assert_eq!(env["Payload"]["SenderID"], "alice");
        assert_eq!(env["Payload"]["Content"], "hello");

        drop(alice);
        wait_for(|| !hub.is_registered(&UserId::from_raw("alice"))).await;

        token.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(msg) = bob.next().await {
                if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                    return true;
                }
            }
            true
        })
        .await
        .unwrap();
        assert!(closed);
        assert_eq!(hub.client_count(), 0);
    }

    async fn start_local(hub: HubConfig, shutdown: CancellationToken) -> ServerHandle {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            hub,
            ..ServerConfig::default()
        };
        start(config, Arc::new(InMemoryBackend::new()), None, shutdown)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_sessions_to_close() {
        let coordinator = ShutdownCoordinator::new();
        let handle = start_local(HubConfig::default(), coordinator.token()).await;
        let port = handle.port();
        let (mut carol, _) = tokio_tungstenite::connect_async(format!(
            "ws://127.0.0.1:{port}/ws?uid=carol"
        ))
        .await
        .unwrap();

        let hub = handle.hub().hub().clone();
        let sessions = handle.sessions().clone();
        wait_for(|| sessions.len() == 1).await;
        assert!(hub.send_to_user(&UserId::from_raw("carol"), Arc::from("last call")));

        let drained = coordinator
            .graceful_shutdown(handle.into_tasks(), Some(Duration::from_secs(5)))
            .await;
        assert!(drained);
        assert!(sessions.is_closed());
        assert!(sessions.is_empty());
        assert_eq!(hub.client_count(), 0);

        let mut texts = Vec::new();
        let mut saw_close = false;
        while let Some(Ok(msg)) = carol.next().await {
            match msg {
                Message::Text(text) => texts.push(text.to_string()),
                Message::Close(_) => {
                    saw_close = true;
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(texts, vec!["last call".to_string()]);
        assert!(saw_close);
    }

    #[tokio::test]
    async fn huge_messages_end_the_connection() {
        let token = CancellationToken::new();
        let hub_config = HubConfig {
            max_frame_size: 256,
            ..HubConfig::default()
        };
        let limit = ws::transport_message_limit(&hub_config);
        let handle = start_local(hub_config, token.clone()).await;
        let port = handle.port();
        let (mut dave, _) = tokio_tungstenite::connect_async(format!(
            "ws://127.0.0.1:{port}/ws?uid=dave"
        ))
        .await
        .unwrap();

        let hub = handle.hub().hub().clone();
        let dave_id = UserId::from_raw("dave");
        wait_for(|| hub.is_registered(&dave_id)).await;

        // Over the hub limit but under the transport limit: dropped, still connected.
        dave.send(Message::Text("x".repeat(1000).into())).await.unwrap();
        let join = r#"{"Event":"JOIN_ROOM","Payload":{"RoomID":"lobby"}}"#;
        dave.send(Message::Text(join.into())).await.unwrap();
        let lobby = RoomId::from_raw("lobby");
        wait_for(|| hub.room_members(&lobby) == vec![dave_id.clone()]).await;

        let _ = dave.send(Message::Text("y".repeat(limit + 1).into())).await;
        wait_for(|| !hub.is_registered(&dave_id)).await;
        assert_eq!(hub.room_count(), 0);
        token.cancel();
    }
}
