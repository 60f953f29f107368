use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parley_core::ids::ConnectionId;
use tokio::sync::{mpsc, Notify};

use crate::topics::TopicChain;

/// One live client socket.
///
/// The registry owns the strong reference; subscription registries hold
/// clones only while a membership lasts.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    identity: OnceLock<String>,
    closed: AtomicBool,
    shutdown: Notify,
    last_pong: AtomicU64,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            identity: OnceLock::new(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    /// Authenticated username, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Set the identity. Returns false if one was already set.
    pub fn set_identity(&self, username: impl Into<String>) -> bool {
        self.identity.set(username.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Stores a permit if the writer is not waiting yet.
        self.shutdown.notify_one();
    }

    /// Resolves once the connection has been closed by the registry.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.shutdown.notified().await;
    }

    /// Queue a frame for the writer task. Never blocks: a full queue drops the
    /// frame.
    pub fn send(&self, frame: String) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    conn_id = %self.id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    topics: Arc<TopicChain>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(topics: Arc<TopicChain>, max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            topics,
            max_send_queue,
        }
    }

    /// Register a new anonymous connection and return it with its outbound queue.
    pub fn register(&self) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(tx));
        self.connections.insert(conn.id.clone(), Arc::clone(&conn));
        (conn, rx)
    }

    /// Register a connection whose identity was established out of band.
    pub fn register_authenticated(
        &self,
        username: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (conn, rx) = self.register();
        conn.set_identity(username);
        (conn, rx)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Close a connection and cascade it out of every subscription.
    /// Unknown ids are ignored.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            conn.close();
            let removed = self.topics.remove_connection(&conn);
            tracing::debug!(conn_id = %id, removed, "connection unregistered");
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove connections that haven't answered a ping within `timeout`.
    pub fn cleanup_dead_connections(&self, timeout: Duration) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(conn_id = %id, "cleaned up dead connection");
        }
        dead.len()
    }
}

/// Drive one WebSocket: a writer forwarding the outbound queue plus periodic
/// pings, and a reader feeding text frames to the dispatcher. The writer also
/// sends a close frame when the registry closes the connection. When either
/// task ends the other is aborted and the connection is unregistered.
pub async fn handle_ws_connection(
    socket: WebSocket,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = Arc::clone(&conn);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                () = writer_conn.closed() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    tracing::debug!(conn_id = %writer_conn.id, "sent close after sweep");
                    break;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn_id = %writer_conn.id, "sent ping");
                }
            }
        }
    });

    let reader_conn = Arc::clone(&conn);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_conn.id.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.unregister(&conn.id);
    tracing::info!(conn_id = %conn.id, "websocket client disconnected");
}

/// Periodically sweep connections that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_connections(timeout);
            if removed > 0 {
                tracing::info!(removed, "dead connection cleanup");
            }
        }
    })
}
