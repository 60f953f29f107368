use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parley_core::ids::ConnectionId;
use parley_core::MutationEvent;
use parley_store::{ChatService, Database};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::commands::CommandChain;
use crate::connection::{self, ConnectionRegistry};
use crate::data::StoreDataAccess;
use crate::dispatcher;
use crate::event_bridge;
use crate::rest;
use crate::settings::ServerSettings;
use crate::topics::TopicChain;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
    pub connections: Arc<ConnectionRegistry>,
    pub frames: mpsc::Sender<(ConnectionId, String)>,
    pub heartbeat: Duration,
    pub started_at: DateTime<Utc>,
}

/// Build the Axum router: live channel, health and the CRUD routes.
pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(rest::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Wire every component and start listening. Returns a handle that keeps the
/// background tasks alive.
pub async fn start(settings: &ServerSettings, db: Database) -> Result<ServerHandle, std::io::Error> {
    settings
        .validate()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let (event_tx, _) = broadcast::channel::<MutationEvent>(settings.event_capacity);
    let service = ChatService::new(db.clone(), event_tx);

    let data = Arc::new(StoreDataAccess::new(db));
    let topics = Arc::new(TopicChain::standard(data.clone()));
    tracing::debug!(roots = ?topics.roots(), "topic chain ready");
    let connections = Arc::new(ConnectionRegistry::new(
        Arc::clone(&topics),
        settings.max_send_queue,
    ));
    let commands = Arc::new(CommandChain::standard(data, Arc::clone(&topics)));

    let bridge = event_bridge::create_bridge(Arc::clone(&topics), service.subscribe());
    let cleanup = connection::start_cleanup_task(
        Arc::clone(&connections),
        settings.cleanup_interval(),
        settings.client_timeout(),
    );

    let (frames_tx, frames_rx) = mpsc::channel(settings.dispatch_queue);
    let dispatch = tokio::spawn(dispatcher::run_dispatcher(
        frames_rx,
        Arc::clone(&connections),
        commands,
    ));

    let state = AppState {
        service: service.clone(),
        connections: Arc::clone(&connections),
        frames: frames_tx,
        heartbeat: settings.heartbeat_interval(),
        started_at: Utc::now(),
    };
    let router = build_router(state, &settings.ws_path);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, ws_path = %settings.ws_path, "parley server started");

    let server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(%error, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        service,
        connections,
        tasks: vec![server, bridge, cleanup, dispatch],
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub port: u16,
    pub service: ChatService,
    pub connections: Arc<ConnectionRegistry>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn, rx) = state.connections.register();
    tracing::info!(conn_id = %conn.id, "websocket client connected");

    connection::handle_ws_connection(
        socket,
        conn,
        rx,
        state.connections,
        state.frames,
        state.heartbeat,
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "connections": state.connections.count(),
        "started_at": state.started_at.to_rfc3339(),
        "uptime_secs": uptime,
    }))
}

/// State over an in-memory store with no dispatcher attached.
#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let db = Database::in_memory().unwrap();
    let (event_tx, _) = broadcast::channel(64);
    let data = Arc::new(StoreDataAccess::new(db.clone()));
    let topics = Arc::new(TopicChain::standard(data));
    let (frames, _) = mpsc::channel(8);
    AppState {
        service: ChatService::new(db, event_tx),
        connections: Arc::new(ConnectionRegistry::new(topics, 32)),
        frames,
        heartbeat: Duration::from_secs(30),
        started_at: Utc::now(),
    }
}
