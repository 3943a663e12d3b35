use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use verdant_protocol::{
    score, AgreementEngine, Decision, Envelope, GossipNode, Handler, HandlerFuture, MessageType,
    StatusSnapshot,
};

use crate::chain::Chain;
use crate::config::Config;
use crate::status;

/// Shared state behind every loop, handler, and the status API.
pub struct NodeInner {
    pub cfg: Config,
    pub gossip: Arc<GossipNode>,
    pub engine: Arc<AgreementEngine>,
    pub chain: Arc<dyn Chain>,
    pub listen_addrs: Vec<SocketAddr>,
    /// Latest status snapshot received from each peer, for the dashboard.
    pub peer_status: RwLock<HashMap<String, StatusSnapshot>>,
    pub last_block: AtomicU64,
    pub proofs_submitted: AtomicU64,
    pub failed_submissions: AtomicU64,
    pub registered: AtomicBool,
    pub shutdown: watch::Receiver<bool>,
}

/// The validator loop: fetch → compute → broadcast → agree → submit.
pub struct ValidatorNode {
    pub inner: Arc<NodeInner>,
}

impl ValidatorNode {
    pub async fn new(
        cfg: Config,
        gossip: Arc<GossipNode>,
        engine: Arc<AgreementEngine>,
        chain: Arc<dyn Chain>,
        listen_addrs: Vec<SocketAddr>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let inner = Arc::new(NodeInner {
            cfg,
            gossip,
            engine,
            chain,
            listen_addrs,
            peer_status: RwLock::new(HashMap::new()),
            last_block: AtomicU64::new(0),
            proofs_submitted: AtomicU64::new(0),
            failed_submissions: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            shutdown,
        });
        register_handlers(&inner).await;
        Self { inner }
    }

    /// Spawn the periodic loops. Handlers are already wired.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { run_fetch_loop(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { run_decision_loop(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { status::run_status_loop(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { status::run_block_poll(inner).await });
    }
}

fn handler<F, Fut>(inner: &Arc<NodeInner>, f: F) -> Handler
where
    F: Fn(Arc<NodeInner>, Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let inner = inner.clone();
    let f = Arc::new(f);
    Arc::new(move |envelope: Envelope| -> HandlerFuture {
        let inner = inner.clone();
        let f = f.clone();
        Box::pin(async move { f(inner, envelope).await })
    })
}

async fn register_handlers(inner: &Arc<NodeInner>) {
    let gossip = inner.gossip.clone();
    gossip
        .register_handler(MessageType::FarmData, handler(inner, on_farm_data))
        .await;
    gossip
        .register_handler(MessageType::FarmScore, handler(inner, on_farm_score))
        .await;
    gossip
        .register_handler(MessageType::Status, handler(inner, on_status))
        .await;
    gossip
        .register_handler(MessageType::Proof, handler(inner, on_proof))
        .await;
    gossip
        .register_handler(MessageType::Sync, handler(inner, on_sync))
        .await;
}

/// A peer shared a returns series: score it independently and vote, so
/// late joiners contribute to rounds they did not initiate.
async fn on_farm_data(inner: Arc<NodeInner>, envelope: Envelope) {
    if envelope.sender == inner.gossip.node_id() {
        // Our own series; the fetch loop already voted on it.
        return;
    }
    let Some(request_id) = envelope.request_id else {
        return;
    };
    let Some(returns) = envelope.returns else {
        return;
    };
    if returns.is_empty() {
        return;
    }

    let score = score::farm_score(&returns);
    inner.engine.record_local_vote(&request_id, score).await;
    tracing::info!(
        request = %request_id,
        from = %envelope.sender,
        score,
        "Scored peer farm data"
    );

    let mut vote = inner.gossip.envelope(MessageType::FarmScore);
    vote.request_id = Some(request_id);
    vote.score = Some(score);
    inner.gossip.broadcast(vote).await;
}

async fn on_farm_score(inner: Arc<NodeInner>, envelope: Envelope) {
    let Some(request_id) = envelope.request_id else {
        return;
    };
    let Some(score) = envelope.score else {
        return;
    };
    inner
        .engine
        .record_peer_vote(&request_id, &envelope.sender, score)
        .await;
    tracing::debug!(request = %request_id, peer = %envelope.sender, score, "Recorded peer vote");
}

async fn on_status(inner: Arc<NodeInner>, envelope: Envelope) {
    let Some(snapshot) = envelope.status else {
        return;
    };
    inner
        .peer_status
        .write()
        .await
        .insert(envelope.sender, snapshot);
}

async fn on_proof(_inner: Arc<NodeInner>, envelope: Envelope) {
    if let Some(proof) = envelope.proof {
        tracing::info!(
            peer = %envelope.sender,
            farm = %proof.farm_id,
            score = proof.score,
            tx = %proof.tx_hash,
            block = proof.block_number,
            "Peer submitted proof"
        );
    }
}

async fn on_sync(_inner: Arc<NodeInner>, envelope: Envelope) {
    tracing::debug!(peer = %envelope.sender, "Sync request ignored (no persisted history)");
}

/// Every fetch tick: pull returns for each active farm, vote locally, and
/// flood both the series and the score.
async fn run_fetch_loop(inner: Arc<NodeInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(inner.cfg.fetch_interval_secs));
    let mut shutdown = inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        run_fetch_tick(&inner).await;
    }
    tracing::debug!("Fetch loop stopped");
}

pub(crate) async fn run_fetch_tick(inner: &Arc<NodeInner>) {
    let farms = match inner.chain.active_farms().await {
        Ok(farms) => farms,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list active farms");
            return;
        }
    };

    for farm_id in farms {
        let returns = match inner.chain.fetch_returns(&farm_id).await {
            Ok(returns) => returns,
            Err(e) => {
                // No local vote for this farm this tick.
                tracing::warn!(farm = %farm_id, error = %e, "Failed to fetch returns, skipping");
                continue;
            }
        };

        let request_id = format!("farm-{}-{}", farm_id, Utc::now().timestamp());
        let score = score::farm_score(&returns);
        inner.engine.record_local_vote(&request_id, score).await;

        let mut data = inner.gossip.envelope(MessageType::FarmData);
        data.request_id = Some(request_id.clone());
        data.returns = Some(returns);
        inner.gossip.broadcast(data).await;

        let mut vote = inner.gossip.envelope(MessageType::FarmScore);
        vote.request_id = Some(request_id.clone());
        vote.score = Some(score);
        inner.gossip.broadcast(vote).await;

        tracing::info!(farm = %farm_id, request = %request_id, score, "Broadcast local score");
    }
}

/// Every decision tick: poll each open request, hand decisions to the
/// chain, drop expired rounds, then sweep.
async fn run_decision_loop(inner: Arc<NodeInner>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(inner.cfg.decision_interval_secs));
    let mut shutdown = inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        run_decision_tick(&inner).await;
    }
    tracing::debug!("Decision loop stopped");
}

pub(crate) async fn run_decision_tick(inner: &Arc<NodeInner>) {
    for request_id in inner.engine.open_ids().await {
        match inner.engine.check(&request_id).await {
            Decision::Pending => {}
            Decision::Decided(score) => {
                submit_decision(inner, &request_id, score).await;
                // Removed either way so submission is never repeated.
                inner.engine.remove(&request_id).await;
            }
            Decision::Expired => {
                tracing::info!(request = %request_id, "Round expired without quorum");
                inner.engine.remove(&request_id).await;
            }
        }
    }

    let retired = inner.engine.sweep(Utc::now()).await;
    if !retired.is_empty() {
        tracing::debug!(count = retired.len(), "Swept expired rounds");
    }
}

async fn submit_decision(inner: &Arc<NodeInner>, request_id: &str, score: f64) {
    match inner.chain.submit_decision(request_id, score).await {
        Ok(tx_hash) => {
            inner.proofs_submitted.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                request = %request_id,
                score,
                tx = %tx_hash,
                "✅ Quorum score submitted"
            );
            status::broadcast_proof(inner, request_id, score, &tx_hash).await;
        }
        Err(e) => {
            inner.failed_submissions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(request = %request_id, error = %e, "Score submission failed");
        }
    }
}

/// The farm id embedded in a `farm-{id}-{unix}` request id.
pub fn farm_of(request_id: &str) -> &str {
    request_id
        .strip_prefix("farm-")
        .and_then(|rest| rest.rsplit_once('-'))
        .map(|(farm, _)| farm)
        .unwrap_or(request_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use verdant_protocol::{AgreementConfig, GossipConfig};

    struct MockChain {
        farms: Vec<String>,
        returns: Result<Vec<f64>, String>,
        submissions: Mutex<Vec<(String, f64)>>,
        fail_submit: bool,
    }

    impl MockChain {
        fn new(returns: Result<Vec<f64>, String>) -> Self {
            Self {
                farms: vec!["7".to_string()],
                returns,
                submissions: Mutex::new(Vec::new()),
                fail_submit: false,
            }
        }
    }

    #[async_trait]
    impl Chain for MockChain {
        async fn active_farms(&self) -> Result<Vec<String>> {
            Ok(self.farms.clone())
        }

        async fn fetch_returns(&self, _farm_id: &str) -> Result<Vec<f64>> {
            self.returns.clone().map_err(|e| anyhow!(e))
        }

        async fn submit_decision(&self, request_id: &str, score: f64) -> Result<String> {
            if self.fail_submit {
                return Err(anyhow!("gateway down"));
            }
            self.submissions
                .lock()
                .unwrap()
                .push((request_id.to_string(), score));
            Ok("0xabc123".to_string())
        }

        async fn is_registered(&self, _address: &str) -> Result<bool> {
            Ok(true)
        }

        async fn latest_block(&self) -> Result<u64> {
            Ok(100)
        }
    }

    fn test_config() -> Config {
        Config {
            rpc_url: "http://127.0.0.1:0".into(),
            auth_token: String::new(),
            validator_address: "0xvalidator".into(),
            data_dir: "/tmp/verdant-test".into(),
            status_port: 0,
            fetch_interval_secs: 30,
            decision_interval_secs: 5,
            status_interval_secs: 60,
            block_poll_secs: 15,
        }
    }

    async fn test_node(chain: Arc<dyn Chain>) -> ValidatorNode {
        let (guard, shutdown) = watch::channel(false);
        // Keep the shutdown channel open for the whole test process.
        std::mem::forget(guard);
        let gossip_config = GossipConfig {
            node_id: "self".into(),
            listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
            ..GossipConfig::default()
        };
        let gossip = Arc::new(GossipNode::new(gossip_config, shutdown.clone()));
        let engine = Arc::new(AgreementEngine::new(
            "self".into(),
            AgreementConfig::default(),
        ));
        ValidatorNode::new(
            test_config(),
            gossip,
            engine,
            chain,
            vec![],
            shutdown,
        )
        .await
    }

    #[tokio::test]
    async fn fetch_tick_records_local_vote() {
        let chain = Arc::new(MockChain::new(Ok(vec![0.024, 0.047, -0.012])));
        let node = test_node(chain).await;

        run_fetch_tick(&node.inner).await;

        let open = node.inner.engine.open_ids().await;
        assert_eq!(open.len(), 1);
        assert!(open[0].starts_with("farm-7-"));
    }

    #[tokio::test]
    async fn fetch_failure_skips_the_tick() {
        let chain = Arc::new(MockChain::new(Err("rpc timeout".to_string())));
        let node = test_node(chain).await;

        run_fetch_tick(&node.inner).await;
        assert!(node.inner.engine.is_empty().await);
    }

    #[tokio::test]
    async fn decision_tick_submits_quorum_score() {
        let chain = Arc::new(MockChain::new(Ok(vec![0.01, 0.02, 0.03])));
        let node = test_node(chain.clone()).await;

        run_fetch_tick(&node.inner).await;
        let request_id = node.inner.engine.open_ids().await.remove(0);
        let expected = score::farm_score(&[0.01, 0.02, 0.03]);
        node.inner
            .engine
            .record_peer_vote(&request_id, "peer-1", expected)
            .await;
        node.inner
            .engine
            .record_peer_vote(&request_id, "peer-2", expected)
            .await;

        run_decision_tick(&node.inner).await;

        // The decision is the class mean, accumulated the same way here.
        let decided = (expected + expected + expected) / 3.0;
        let submissions = chain.submissions.lock().unwrap().clone();
        assert_eq!(submissions, vec![(request_id.clone(), decided)]);
        assert!(node.inner.engine.is_empty().await);
        assert_eq!(node.inner.proofs_submitted.load(Ordering::Relaxed), 1);

        // A second tick must not resubmit.
        run_decision_tick(&node.inner).await;
        assert_eq!(chain.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_submission_still_clears_the_round() {
        let mut mock = MockChain::new(Ok(vec![0.01, 0.02, 0.03]));
        mock.fail_submit = true;
        let chain = Arc::new(mock);
        let node = test_node(chain.clone()).await;

        run_fetch_tick(&node.inner).await;
        let request_id = node.inner.engine.open_ids().await.remove(0);
        let expected = score::farm_score(&[0.01, 0.02, 0.03]);
        node.inner
            .engine
            .record_peer_vote(&request_id, "peer-1", expected)
            .await;

        run_decision_tick(&node.inner).await;

        assert!(node.inner.engine.is_empty().await);
        assert_eq!(node.inner.failed_submissions.load(Ordering::Relaxed), 1);
        assert!(chain.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn peer_score_feeds_the_engine() {
        let chain = Arc::new(MockChain::new(Ok(vec![])));
        let node = test_node(chain).await;

        let mut envelope = node.inner.gossip.envelope(MessageType::FarmScore);
        envelope.sender = "peer-1".into();
        envelope.request_id = Some("farm-7-1700000000".into());
        envelope.score = Some(1.5);
        on_farm_score(node.inner.clone(), envelope).await;

        assert_eq!(node.inner.engine.len().await, 1);
    }

    #[tokio::test]
    async fn peer_farm_data_triggers_independent_vote() {
        let chain = Arc::new(MockChain::new(Ok(vec![])));
        let node = test_node(chain).await;

        let mut envelope = node.inner.gossip.envelope(MessageType::FarmData);
        envelope.sender = "peer-1".into();
        envelope.request_id = Some("farm-9-1700000000".into());
        envelope.returns = Some(vec![0.024, 0.047, -0.012]);
        on_farm_data(node.inner.clone(), envelope).await;

        let open = node.inner.engine.open_ids().await;
        assert_eq!(open, vec!["farm-9-1700000000".to_string()]);
    }

    #[tokio::test]
    async fn own_farm_data_is_not_rescored() {
        let chain = Arc::new(MockChain::new(Ok(vec![])));
        let node = test_node(chain).await;

        let mut envelope = node.inner.gossip.envelope(MessageType::FarmData);
        envelope.request_id = Some("farm-9-1700000000".into());
        envelope.returns = Some(vec![0.024]);
        on_farm_data(node.inner.clone(), envelope).await;

        assert!(node.inner.engine.is_empty().await);
    }

    #[test]
    fn farm_id_extraction() {
        assert_eq!(farm_of("farm-7-1700000000"), "7");
        assert_eq!(farm_of("farm-alpha-beta-1700000000"), "alpha-beta");
        assert_eq!(farm_of("unexpected"), "unexpected");
    }

    async fn networked_node(
        id: &str,
        chain: Arc<dyn Chain>,
        shutdown: watch::Receiver<bool>,
    ) -> (ValidatorNode, SocketAddr) {
        let gossip_config = GossipConfig {
            node_id: id.to_string(),
            listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
            ..GossipConfig::default()
        };
        let gossip = Arc::new(GossipNode::new(gossip_config, shutdown.clone()));
        let bound = gossip.start().await.unwrap();
        let engine = Arc::new(AgreementEngine::new(
            id.to_string(),
            AgreementConfig::default(),
        ));
        let node = ValidatorNode::new(
            test_config(),
            gossip,
            engine,
            chain,
            bound.clone(),
            shutdown,
        )
        .await;
        (node, bound[0])
    }

    #[tokio::test]
    async fn three_nodes_reach_quorum_over_the_wire() {
        let (_guard, shutdown) = watch::channel(false);
        let returns = vec![0.024, 0.047, 0.036, -0.012, 0.053];

        let chains: Vec<Arc<MockChain>> = (0..3)
            .map(|_| Arc::new(MockChain::new(Ok(returns.clone()))))
            .collect();
        let (a, addr_a) =
            networked_node("node-a", chains[0].clone(), shutdown.clone()).await;
        let (b, addr_b) =
            networked_node("node-b", chains[1].clone(), shutdown.clone()).await;
        let (c, addr_c) =
            networked_node("node-c", chains[2].clone(), shutdown.clone()).await;

        for (node, others) in [
            (&a, [("node-b", addr_b), ("node-c", addr_c)]),
            (&b, [("node-a", addr_a), ("node-c", addr_c)]),
            (&c, [("node-a", addr_a), ("node-b", addr_b)]),
        ] {
            for (id, addr) in others {
                node.inner.gossip.peers.upsert(id, addr).await;
            }
        }

        // Only node-a initiates; b and c contribute via the farm_data path.
        run_fetch_tick(&a.inner).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        run_decision_tick(&a.inner).await;
        run_decision_tick(&b.inner).await;
        run_decision_tick(&c.inner).await;

        let score = score::farm_score(&returns);
        let decided = (score + score + score) / 3.0;
        for chain in &chains {
            let submissions = chain.submissions.lock().unwrap().clone();
            assert_eq!(submissions.len(), 1, "every node submits exactly once");
            assert!(submissions[0].0.starts_with("farm-7-"));
            assert_eq!(submissions[0].1, decided, "all nodes agree bit-for-bit");
        }
    }
}
