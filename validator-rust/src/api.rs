use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::runner::NodeInner;
use crate::status;

pub fn create_router(inner: Arc<NodeInner>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/ping", get(ping_handler))
        .layer(CorsLayer::permissive())
        .with_state(inner)
}

/// The dashboard snapshot: node identity, overlay view, chain state, and
/// the agreement queue.
async fn status_handler(State(inner): State<Arc<NodeInner>>) -> Json<Value> {
    let peer_status = inner.peer_status.read().await;
    let peers: Vec<Value> = inner
        .gossip
        .peers
        .snapshot()
        .await
        .into_iter()
        .map(|peer| {
            let status = peer_status.get(&peer.id);
            json!({
                "id": peer.id,
                "address": peer.address,
                "last_seen": peer.last_seen,
                "registered": status.map(|s| s.registered),
                "last_block": status.map(|s| s.last_block),
                "proofs_submitted": status.map(|s| s.proofs_submitted),
            })
        })
        .collect();

    let local = status::local_snapshot(&inner);
    Json(json!({
        "node_id": inner.gossip.node_id(),
        "listen_addresses": inner.listen_addrs,
        "peer_count": peers.len(),
        "peers": peers,
        "registered": local.registered,
        "last_block": local.last_block,
        "queue_size": inner.engine.len().await,
        "proofs_submitted": local.proofs_submitted,
        "failed_submissions": inner.failed_submissions.load(Ordering::Relaxed),
    }))
}

async fn ping_handler(State(inner): State<Arc<NodeInner>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_id": inner.gossip.node_id(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Serve the status API until shutdown. A bind failure warns and returns;
/// the validator keeps running without its dashboard.
pub async fn serve(inner: Arc<NodeInner>, port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(addr = %addr, error = %e, "Status API failed to bind");
            return;
        }
    };
    tracing::info!(addr = %addr, "Status API listening");

    let app = create_router(inner);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, "Status API stopped with error");
    }
}
