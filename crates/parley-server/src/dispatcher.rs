use std::sync::Arc;

use parley_core::ids::ConnectionId;
use tokio::sync::mpsc;

use crate::commands::CommandChain;
use crate::connection::ConnectionRegistry;
use crate::frame::CommandFrame;

/// Parse one raw frame and hand it to the command chain. Frames that don't
/// parse, or that arrive for a connection already gone, are dropped.
pub async fn dispatch_frame(
    registry: &ConnectionRegistry,
    chain: &CommandChain,
    conn_id: &ConnectionId,
    raw: &str,
) -> bool {
    let Some(conn) = registry.get(conn_id) else {
        tracing::debug!(conn_id = %conn_id, "frame for unknown connection dropped");
        return false;
    };
    let Some(frame) = CommandFrame::parse(raw) else {
        tracing::debug!(conn_id = %conn_id, frame_len = raw.len(), "unparseable frame dropped");
        return false;
    };
    chain.dispatch(&conn, frame).await
}

/// Single consumer for every connection's inbound frames, so commands are
/// handled one at a time in arrival order.
pub async fn run_dispatcher(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    registry: Arc<ConnectionRegistry>,
    chain: Arc<CommandChain>,
) {
    while let Some((conn_id, raw)) = rx.recv().await {
        dispatch_frame(&registry, &chain, &conn_id, &raw).await;
    }
    tracing::info!("dispatcher channel closed");
}
