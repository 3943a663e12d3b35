//! Verdant P2P scoring protocol
//!
//! Every validator in the verdant network independently scores farms and
//! cooperates with its peers to agree on a single score before settlement.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  flood relay  ┌──────────┐  flood relay  ┌──────────┐
//!  │Validator │◄─────────────►│Validator │◄─────────────►│Validator │
//!  │    A     │               │    B     │               │    C     │
//!  └──────────┘               └──────────┘               └──────────┘
//!       ▲                                                     ▲
//!       └──────────────── score agreement ────────────────────┘
//! ```
//!
//! ## Scoring round
//! - A validator fetches a farm's returns series and computes its score
//! - Both the raw series (`farm_data`) and the score (`farm_score`) are
//!   flooded to every peer
//! - Peers recompute the score from the series and flood their own votes
//! - Once 2/3 of the votes agree, the round is decided and the agreed
//!   score is handed to the settlement chain
//!
//! ## Gossip overlay
//! - Each node maintains a peer table with last-seen liveness
//! - Messages carry a unique id; a seen-set suppresses relay loops
//! - Discovery beacons advertise the listen port every 10 seconds
//! - Peers unseen for two minutes are evicted

pub mod agreement;
pub mod config;
pub mod gossip;
pub mod peer;
pub mod score;
pub mod transport;
pub mod types;

pub use agreement::{AgreementConfig, AgreementEngine, Decision, QuorumMode};
pub use config::P2pConfig;
pub use gossip::{GossipConfig, GossipNode, Handler, HandlerFuture};
pub use peer::{PeerInfo, PeerRegistry};
pub use transport::Transport;
pub use types::*;
