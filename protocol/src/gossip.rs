use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::peer::PeerRegistry;
use crate::transport::{InboundFrame, Transport, TransportError};
use crate::types::{self, Envelope, MessageType, NodeId};

/// How often discovery beacons go out.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// How often heartbeats go out.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Seen-set retention; at least 10× the discovery interval so relay
/// fan-in duplicates are always suppressed.
pub const SEEN_TTL_SECS: i64 = 120;

/// Future returned by a message handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered per-type message handler. The overlay clones the envelope
/// and holds no lock while the handler runs, so handlers are free to call
/// back into `broadcast`.
pub type Handler = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// Configuration for the gossip overlay.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// This node's unique session id.
    pub node_id: NodeId,
    /// Addresses to listen on.
    pub listen_addrs: Vec<SocketAddr>,
    /// Port advertised in discovery beacons; 0 means "use the first
    /// bound listener's port".
    pub advertise_port: u16,
    /// Bootstrap peers: address plus optional known identity.
    pub bootstrap_peers: Vec<(SocketAddr, Option<NodeId>)>,
    pub discovery_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            listen_addrs: vec!["0.0.0.0:9000".parse().expect("static addr")],
            advertise_port: 0,
            bootstrap_peers: vec![],
            discovery_interval: DISCOVERY_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// A verdant gossip node — flood relay with loop suppression.
///
/// Each node:
/// 1. Accepts inbound streams and reads newline frames from peers
/// 2. Floods every new message to all known peers (seen-set suppressed)
/// 3. Beacons `peer_discovery` so peers learn each other's dial address
/// 4. Dispatches messages to per-type handlers, local sends included
pub struct GossipNode {
    config: GossipConfig,
    pub peers: PeerRegistry,
    transport: Transport,
    inbound: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    seen: RwLock<HashMap<String, DateTime<Utc>>>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    nonce: AtomicU64,
    advertise_port: AtomicU16,
    shutdown: watch::Receiver<bool>,
}

impl GossipNode {
    pub fn new(config: GossipConfig, shutdown: watch::Receiver<bool>) -> Self {
        let (transport, inbound) = Transport::new(shutdown.clone());
        let peers = PeerRegistry::new(config.node_id.clone());
        let advertise_port = AtomicU16::new(config.advertise_port);
        Self {
            config,
            peers,
            transport,
            inbound: Mutex::new(Some(inbound)),
            seen: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            nonce: AtomicU64::new(0),
            advertise_port,
            shutdown,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Start listening, the inbound pump, and the beacon loops. Returns
    /// the bound listen addresses; fails only if no listener could bind.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<SocketAddr>, TransportError> {
        let mut bound = Vec::new();
        let mut last_err = None;
        for addr in &self.config.listen_addrs {
            match self.transport.listen(*addr).await {
                Ok(local) => bound.push(local),
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Failed to listen");
                    last_err = Some(e);
                }
            }
        }
        let Some(first) = bound.first() else {
            return Err(last_err.unwrap_or(TransportError::NoListener));
        };
        if self.advertise_port.load(Ordering::Relaxed) == 0 {
            self.advertise_port.store(first.port(), Ordering::Relaxed);
        }
        tracing::info!(
            node_id = %self.config.node_id,
            addrs = ?bound,
            "P2P gossip node listening"
        );

        let inbound = self
            .inbound
            .lock()
            .await
            .take()
            .expect("gossip node started twice");
        let node = self.clone();
        tokio::spawn(async move { node.run_inbound(inbound).await });

        let node = self.clone();
        tokio::spawn(async move { node.run_discovery().await });

        let node = self.clone();
        tokio::spawn(async move { node.run_heartbeat().await });

        self.connect_bootstrap().await;
        Ok(bound)
    }

    /// Register the handler for a message type, replacing any previous one.
    pub async fn register_handler(&self, kind: MessageType, handler: Handler) {
        self.handlers.write().await.insert(kind, handler);
    }

    /// Build an envelope stamped with this node's identity and a fresh
    /// message id.
    pub fn envelope(&self, kind: MessageType) -> Envelope {
        Envelope {
            kind,
            sender: self.config.node_id.clone(),
            request_id: None,
            returns: None,
            score: None,
            status: None,
            proof: None,
            listen_port: None,
            timestamp: Utc::now().timestamp(),
            nonce: self.nonce.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Flood an envelope to every known peer.
    ///
    /// Re-broadcasting an already-seen envelope is a no-op. The envelope
    /// is also dispatched to the local handler before any network send, so
    /// the node's own messages take the same path as inbound ones.
    pub async fn broadcast(&self, envelope: Envelope) {
        let id = envelope.message_id();
        if self.seen.read().await.contains_key(&id) {
            return;
        }
        // Local delivery first, outside any lock.
        self.dispatch(envelope.clone()).await;
        self.seen.write().await.insert(id, Utc::now());
        self.fan_out(&envelope, &[]).await;
    }

    async fn dispatch(&self, envelope: Envelope) {
        let handler = self.handlers.read().await.get(&envelope.kind).cloned();
        if let Some(handler) = handler {
            handler(envelope).await;
        }
    }

    /// Send to every live peer except the excluded ids. Best-effort: each
    /// peer is tried independently and failures are only logged.
    async fn fan_out(&self, envelope: &Envelope, exclude: &[NodeId]) {
        let frame = match types::encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode outbound envelope");
                return;
            }
        };
        for peer in self.peers.snapshot().await {
            if exclude.iter().any(|id| id == &peer.id) {
                continue;
            }
            let transport = self.transport.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send(&peer.id, peer.address, frame).await {
                    tracing::debug!(peer = %peer.id, error = %e, "Send failed");
                }
            });
        }
    }

    async fn run_inbound(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundFrame>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            self.handle_frame(frame).await;
        }
        tracing::debug!(node_id = %self.config.node_id, "Inbound pump stopped");
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        let envelope = match types::decode(frame.line.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(remote = %frame.remote, error = %e, "Dropping malformed frame");
                return;
            }
        };

        // The first frame on a connection pins its peer identity so the
        // connection can be reused for outbound sends.
        self.transport.bind_peer(frame.remote, &envelope.sender).await;
        self.peers.touch(&envelope.sender).await;

        if envelope.kind == MessageType::PeerDiscovery {
            self.handle_discovery(&envelope, frame.remote).await;
        }

        let id = envelope.message_id();
        {
            let mut seen = self.seen.write().await;
            if seen.contains_key(&id) {
                return;
            }
            seen.insert(id, Utc::now());
        }

        self.dispatch(envelope.clone()).await;

        // Relay to everyone except the originator and the upstream hop.
        let mut exclude = vec![envelope.sender.clone()];
        if let Some(upstream) = self.transport.peer_for(frame.remote).await {
            if upstream != envelope.sender {
                exclude.push(upstream);
            }
        }
        self.fan_out(&envelope, &exclude).await;
    }

    /// Learn an unknown peer's dial address from its discovery beacon: the
    /// remote endpoint's IP plus the advertised listen port. Known peers
    /// are left alone — relayed beacons carry the relay's endpoint, not
    /// the sender's.
    async fn handle_discovery(&self, envelope: &Envelope, remote: SocketAddr) {
        let Some(port) = envelope.listen_port else {
            tracing::debug!(sender = %envelope.sender, "Discovery beacon without listen port");
            return;
        };
        if envelope.sender == self.config.node_id || self.peers.get(&envelope.sender).await.is_some()
        {
            return;
        }
        let address = SocketAddr::new(remote.ip(), port);
        self.peers.upsert(&envelope.sender, address).await;
    }

    async fn run_discovery(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            self.peers.prune_stale(Utc::now()).await;
            self.prune_seen().await;

            // Lost everyone — try the bootstrap peers again.
            if self.peers.count().await == 0 && !self.config.bootstrap_peers.is_empty() {
                self.connect_bootstrap().await;
            }

            let mut beacon = self.envelope(MessageType::PeerDiscovery);
            beacon.listen_port = Some(self.advertise_port.load(Ordering::Relaxed));
            self.broadcast(beacon).await;
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let heartbeat = self.envelope(MessageType::Heartbeat);
            self.broadcast(heartbeat).await;
        }
    }

    /// Dial the configured bootstrap peers and introduce ourselves with a
    /// discovery beacon.
    async fn connect_bootstrap(&self) {
        for (addr, id) in &self.config.bootstrap_peers {
            // Until the peer's first message reveals its identity, key the
            // entry by its address; the placeholder goes stale and is
            // pruned once the real id takes over.
            let peer_id = id.clone().unwrap_or_else(|| addr.to_string());
            self.peers.upsert(&peer_id, *addr).await;

            let mut hello = self.envelope(MessageType::PeerDiscovery);
            hello.listen_port = Some(self.advertise_port.load(Ordering::Relaxed));
            let frame = match types::encode(&hello) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode bootstrap hello");
                    continue;
                }
            };
            match self.transport.send(&peer_id, *addr, frame).await {
                Ok(()) => tracing::info!(peer = %addr, "Contacted bootstrap peer"),
                Err(e) => tracing::warn!(peer = %addr, error = %e, "Bootstrap dial failed"),
            }
        }
    }

    async fn prune_seen(&self) {
        let horizon = Utc::now() - ChronoDuration::seconds(SEEN_TTL_SECS);
        let mut seen = self.seen.write().await;
        seen.retain(|_, first_seen| *first_seen > horizon);
    }

    #[cfg(test)]
    async fn seen_len(&self) -> usize {
        self.seen.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(node_id: &str) -> GossipConfig {
        GossipConfig {
            node_id: node_id.to_string(),
            listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
            advertise_port: 0,
            bootstrap_peers: vec![],
            discovery_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(3600),
        }
    }

    async fn start_node(
        config: GossipConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<GossipNode>, SocketAddr) {
        let node = Arc::new(GossipNode::new(config, shutdown));
        let bound = node.start().await.unwrap();
        (node, bound[0])
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_envelope: Envelope| -> HandlerFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn broadcast_is_idempotent() {
        let (_guard, shutdown) = watch::channel(false);
        let node = Arc::new(GossipNode::new(test_config("a"), shutdown));
        let counter = Arc::new(AtomicUsize::new(0));
        node.register_handler(MessageType::Heartbeat, counting_handler(counter.clone()))
            .await;

        let envelope = node.envelope(MessageType::Heartbeat);
        node.broadcast(envelope.clone()).await;
        node.broadcast(envelope).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(node.seen_len().await, 1);
    }

    #[tokio::test]
    async fn handler_runs_at_most_once_per_message() {
        let (_guard, shutdown) = watch::channel(false);
        let (a, addr_a) = start_node(test_config("a"), shutdown.clone()).await;
        let (b, addr_b) = start_node(test_config("b"), shutdown.clone()).await;

        a.peers.upsert("b", addr_b).await;
        b.peers.upsert("a", addr_a).await;

        let counter = Arc::new(AtomicUsize::new(0));
        b.register_handler(MessageType::FarmScore, counting_handler(counter.clone()))
            .await;

        let mut envelope = a.envelope(MessageType::FarmScore);
        envelope.request_id = Some("farm-1-1".into());
        envelope.score = Some(1.5);
        // Two broadcasts of the same envelope: one delivery at b.
        a.broadcast(envelope.clone()).await;
        a.broadcast(envelope).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relay_reaches_indirect_peers_exactly_once() {
        let (_guard, shutdown) = watch::channel(false);
        // Ring topology: a ↔ b ↔ c ↔ d ↔ a.
        let (a, addr_a) = start_node(test_config("a"), shutdown.clone()).await;
        let (b, addr_b) = start_node(test_config("b"), shutdown.clone()).await;
        let (c, addr_c) = start_node(test_config("c"), shutdown.clone()).await;
        let (d, addr_d) = start_node(test_config("d"), shutdown.clone()).await;

        a.peers.upsert("b", addr_b).await;
        a.peers.upsert("d", addr_d).await;
        b.peers.upsert("a", addr_a).await;
        b.peers.upsert("c", addr_c).await;
        c.peers.upsert("b", addr_b).await;
        c.peers.upsert("d", addr_d).await;
        d.peers.upsert("c", addr_c).await;
        d.peers.upsert("a", addr_a).await;

        let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        b.register_handler(MessageType::FarmData, counting_handler(counters[0].clone()))
            .await;
        c.register_handler(MessageType::FarmData, counting_handler(counters[1].clone()))
            .await;
        d.register_handler(MessageType::FarmData, counting_handler(counters[2].clone()))
            .await;

        let mut envelope = a.envelope(MessageType::FarmData);
        envelope.request_id = Some("farm-1-1".into());
        envelope.returns = Some(vec![0.01, 0.02]);
        a.broadcast(envelope).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn beacons_discover_peers_both_ways() {
        let (_guard, shutdown) = watch::channel(false);
        let (a, addr_a) = start_node(test_config("a"), shutdown.clone()).await;

        let mut config_b = test_config("b");
        config_b.bootstrap_peers = vec![(addr_a, None)];
        let (b, _addr_b) = start_node(config_b, shutdown.clone()).await;

        // b introduces itself to a; a's beacons flow back to b.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(a.peers.get("b").await.is_some(), "a should discover b");
        assert!(b.peers.get("a").await.is_some(), "b should discover a");
    }
}
