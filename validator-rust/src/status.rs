//! Validator status heartbeats and proof announcements.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use verdant_protocol::{MessageType, ProofAnnouncement, StatusSnapshot};

use crate::runner::{farm_of, NodeInner};

/// This node's current status snapshot.
pub fn local_snapshot(inner: &NodeInner) -> StatusSnapshot {
    StatusSnapshot {
        address: inner.cfg.validator_address.clone(),
        registered: inner.registered.load(Ordering::Relaxed),
        last_block: inner.last_block.load(Ordering::Relaxed),
        proofs_submitted: inner.proofs_submitted.load(Ordering::Relaxed),
    }
}

async fn broadcast_status(inner: &Arc<NodeInner>) {
    let mut envelope = inner.gossip.envelope(MessageType::Status);
    envelope.status = Some(local_snapshot(inner));
    inner.gossip.broadcast(envelope).await;
}

/// Periodic status beacon. Also refreshes registration state from the
/// chain so peers and the dashboard see it without a restart.
pub async fn run_status_loop(inner: Arc<NodeInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(inner.cfg.status_interval_secs));
    let mut shutdown = inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        match inner.chain.is_registered(&inner.cfg.validator_address).await {
            Ok(registered) => inner.registered.store(registered, Ordering::Relaxed),
            Err(e) => tracing::warn!(error = %e, "Failed to check registration"),
        }
        broadcast_status(&inner).await;
    }
    tracing::debug!("Status loop stopped");
}

/// Track the chain head. Every tenth block triggers an extra status
/// broadcast on top of the fixed cadence.
pub async fn run_block_poll(inner: Arc<NodeInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(inner.cfg.block_poll_secs));
    let mut shutdown = inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let block = match inner.chain.latest_block().await {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll latest block");
                continue;
            }
        };
        let previous = inner.last_block.swap(block, Ordering::Relaxed);
        if block != previous && block % 10 == 0 {
            tracing::debug!(block, "Block boundary status broadcast");
            broadcast_status(&inner).await;
        }
    }
    tracing::debug!("Block poll stopped");
}

/// Announce a submitted proof to the network. Informational only.
pub async fn broadcast_proof(inner: &Arc<NodeInner>, request_id: &str, score: f64, tx_hash: &str) {
    let mut envelope = inner.gossip.envelope(MessageType::Proof);
    envelope.request_id = Some(request_id.to_string());
    envelope.proof = Some(ProofAnnouncement {
        farm_id: farm_of(request_id).to_string(),
        score,
        tx_hash: tx_hash.to_string(),
        block_number: inner.last_block.load(Ordering::Relaxed),
    });
    inner.gossip.broadcast(envelope).await;
}
