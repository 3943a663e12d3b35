//! Per-request score agreement.
//!
//! Each scoring round is a request: the local vote plus every peer's vote,
//! decided once a 2/3 supermajority agrees. Two quorum rules exist — exact
//! numeric match and 1% relative tolerance — and the active rule is fixed
//! at build time with the `exact-quorum` cargo feature.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::NodeId;

/// How long a request may stay undecided before it is retired.
pub const REQUEST_TIMEOUT_SECS: i64 = 300;

/// Relative difference under which two scores count as agreeing in
/// tolerance mode.
pub const SCORE_TOLERANCE: f64 = 0.01;

/// The quorum rule in effect. Fixed at build time, not per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumMode {
    /// Votes agree only on exact numeric equality.
    Exact,
    /// Votes within 1% relative difference form an equivalence class;
    /// the decision is the class mean.
    Tolerance,
}

impl Default for QuorumMode {
    fn default() -> Self {
        if cfg!(feature = "exact-quorum") {
            QuorumMode::Exact
        } else {
            QuorumMode::Tolerance
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgreementConfig {
    pub mode: QuorumMode,
    pub request_timeout: Duration,
    pub tolerance: f64,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            mode: QuorumMode::default(),
            request_timeout: Duration::seconds(REQUEST_TIMEOUT_SECS),
            tolerance: SCORE_TOLERANCE,
        }
    }
}

/// Outcome of polling a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Pending,
    Decided(f64),
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RequestState {
    Open,
    Decided(f64),
    TimedOut,
}

#[derive(Debug)]
struct Request {
    local_vote: Option<f64>,
    peer_votes: HashMap<NodeId, f64>,
    created: DateTime<Utc>,
    state: RequestState,
}

impl Request {
    fn new() -> Self {
        Self {
            local_vote: None,
            peer_votes: HashMap::new(),
            created: Utc::now(),
            state: RequestState::Open,
        }
    }
}

/// The agreement engine. Sole owner of request records; every other
/// component refers to requests by id only.
pub struct AgreementEngine {
    node_id: NodeId,
    config: AgreementConfig,
    requests: RwLock<HashMap<String, Request>>,
}

impl AgreementEngine {
    pub fn new(node_id: NodeId, config: AgreementConfig) -> Self {
        Self {
            node_id,
            config,
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// Record this node's own score, creating the request if needed.
    /// Votes for decided or timed-out requests are silently ignored.
    pub async fn record_local_vote(&self, request_id: &str, score: f64) {
        let mut requests = self.requests.write().await;
        let request = requests
            .entry(request_id.to_string())
            .or_insert_with(Request::new);
        if request.state != RequestState::Open {
            return;
        }
        request.local_vote = Some(score);
    }

    /// Record a peer's score; a later vote from the same peer replaces its
    /// earlier one. A vote carrying this node's own id is folded into the
    /// local-vote slot so the local broadcast path never double-counts.
    pub async fn record_peer_vote(&self, request_id: &str, peer_id: &str, score: f64) {
        if peer_id == self.node_id {
            self.record_local_vote(request_id, score).await;
            return;
        }
        let mut requests = self.requests.write().await;
        let request = requests
            .entry(request_id.to_string())
            .or_insert_with(Request::new);
        if request.state != RequestState::Open {
            return;
        }
        request.peer_votes.insert(peer_id.to_string(), score);
    }

    /// Poll a request. The first successful quorum freezes the decision:
    /// votes arriving afterwards cannot change it.
    pub async fn check(&self, request_id: &str) -> Decision {
        let mut requests = self.requests.write().await;
        let Some(request) = requests.get_mut(request_id) else {
            return Decision::Pending;
        };
        match request.state {
            RequestState::Decided(score) => Decision::Decided(score),
            RequestState::TimedOut => Decision::Expired,
            RequestState::Open => {
                if Utc::now() - request.created > self.config.request_timeout {
                    request.state = RequestState::TimedOut;
                    return Decision::Expired;
                }
                let votes = self.vote_set(request);
                match self.decide(&votes) {
                    Some(score) => {
                        request.state = RequestState::Decided(score);
                        Decision::Decided(score)
                    }
                    None => Decision::Pending,
                }
            }
        }
    }

    /// Retire requests past the timeout horizon and return their ids so
    /// callers stop polling them.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut requests = self.requests.write().await;
        let expired: Vec<String> = requests
            .iter()
            .filter(|(_, r)| match r.state {
                RequestState::Open | RequestState::TimedOut => {
                    now - r.created > self.config.request_timeout
                }
                RequestState::Decided(_) => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            requests.remove(id);
            tracing::info!(request = %id, "Request retired without quorum");
        }
        expired
    }

    /// Ids of requests still worth polling.
    pub async fn open_ids(&self) -> Vec<String> {
        let requests = self.requests.read().await;
        requests
            .iter()
            .filter(|(_, r)| r.state != RequestState::TimedOut)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop a request, typically after its decision was handed off.
    pub async fn remove(&self, request_id: &str) {
        self.requests.write().await.remove(request_id);
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }

    fn vote_set(&self, request: &Request) -> Vec<(NodeId, f64)> {
        let mut votes: Vec<(NodeId, f64)> = Vec::with_capacity(request.peer_votes.len() + 1);
        if let Some(score) = request.local_vote {
            votes.push((self.node_id.clone(), score));
        }
        for (peer, score) in &request.peer_votes {
            votes.push((peer.clone(), *score));
        }
        votes
    }

    fn decide(&self, votes: &[(NodeId, f64)]) -> Option<f64> {
        if votes.len() < 2 {
            return None;
        }
        match self.config.mode {
            QuorumMode::Exact => exact_quorum(votes),
            QuorumMode::Tolerance => tolerance_quorum(votes, self.config.tolerance),
        }
    }
}

/// Bucket votes by exact value; decide the largest bucket's score once it
/// holds at least 2/3 of the vote set. Equal-size buckets break ties
/// toward the smaller score.
fn exact_quorum(votes: &[(NodeId, f64)]) -> Option<f64> {
    let mut buckets: HashMap<u64, (f64, usize)> = HashMap::new();
    for (_, score) in votes {
        let entry = buckets.entry(score.to_bits()).or_insert((*score, 0));
        entry.1 += 1;
    }

    let mut best: Option<(f64, usize)> = None;
    for &(score, count) in buckets.values() {
        best = match best {
            None => Some((score, count)),
            Some((best_score, best_count)) => {
                if count > best_count || (count == best_count && score < best_score) {
                    Some((score, count))
                } else {
                    best
                }
            }
        };
    }

    let (score, count) = best?;
    if count * 3 >= votes.len() * 2 {
        Some(score)
    } else {
        None
    }
}

/// Group votes into 1%-relative equivalence classes against the first
/// member of each class and decide the mean of the largest class once it
/// holds a ceil(2/3) supermajority.
///
/// Votes are ordered by (score, voter) before grouping so every node with
/// the same vote set forms the same classes; class creation order then
/// makes the smallest-score class win size ties.
fn tolerance_quorum(votes: &[(NodeId, f64)], tolerance: f64) -> Option<f64> {
    let mut ordered = votes.to_vec();
    ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut classes: Vec<Vec<f64>> = Vec::new();
    'votes: for (_, score) in &ordered {
        for class in &mut classes {
            let reference = class[0];
            let agrees = if reference == 0.0 {
                *score == 0.0
            } else {
                ((score - reference) / reference).abs() <= tolerance
            };
            if agrees {
                class.push(*score);
                continue 'votes;
            }
        }
        classes.push(vec![*score]);
    }

    let mut largest = &classes[0];
    for class in &classes[1..] {
        if class.len() > largest.len() {
            largest = class;
        }
    }

    let needed = (2 * votes.len() + 2) / 3; // ceil(2n/3)
    if largest.len() < needed {
        return None;
    }

    let mut sum = 0.0;
    for score in largest {
        sum += score;
    }
    Some(sum / largest.len() as f64)
}
