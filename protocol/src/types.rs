use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unique node identifier
pub type NodeId = String;

/// Longest returns series accepted from the wire.
pub const MAX_RETURNS_LEN: usize = 10_000;

/// Largest score magnitude accepted from the wire.
pub const MAX_SCORE_MAGNITUDE: f64 = 1e9;

/// The closed set of message types carried by the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    FarmData,
    FarmScore,
    Status,
    Proof,
    Sync,
    PeerDiscovery,
    Heartbeat,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MessageType::FarmData => "farm_data",
            MessageType::FarmScore => "farm_score",
            MessageType::Status => "status",
            MessageType::Proof => "proof",
            MessageType::Sync => "sync",
            MessageType::PeerDiscovery => "peer_discovery",
            MessageType::Heartbeat => "heartbeat",
        };
        f.write_str(tag)
    }
}

/// A validator's periodic status snapshot. Informational only — status
/// messages never feed score agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub address: String,
    pub registered: bool,
    pub last_block: u64,
    pub proofs_submitted: u64,
}

/// Announcement of a proof submitted to the settlement chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofAnnouncement {
    pub farm_id: String,
    pub score: f64,
    pub tx_hash: String,
    pub block_number: u64,
}

/// A message exchanged between validators.
///
/// One envelope per newline-terminated JSON frame. The payload fields are
/// optional and which of them is populated depends on `kind`. The `nonce`
/// is session-monotonic so two messages of the same type sent within the
/// same second still have distinct message ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofAnnouncement>,
    /// Advertised listen port, only on `peer_discovery`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    pub timestamp: i64,
    #[serde(default)]
    pub nonce: u64,
}

impl Envelope {
    /// The id used for loop suppression in the overlay's seen-set.
    pub fn message_id(&self) -> String {
        format!("{}-{}-{}-{}", self.kind, self.sender, self.timestamp, self.nonce)
    }
}

/// Reasons a frame is rejected. Malformed frames are dropped and logged;
/// the stream they arrived on continues.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid frame: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing sender")]
    MissingSender,
    #[error("non-finite numeric field")]
    NonFinite,
    #[error("returns series too long: {0}")]
    SeriesTooLong(usize),
    #[error("score out of range: {0}")]
    ScoreOutOfRange(f64),
}

/// Encode an envelope as a newline-terminated JSON frame.
///
/// serde_json escapes control characters inside string values, so the
/// trailing `\n` is the only newline in the frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut frame = serde_json::to_vec(envelope)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode and validate one frame (with or without its trailing newline).
pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    let envelope: Envelope = serde_json::from_slice(frame)?;
    validate(&envelope)?;
    Ok(envelope)
}

fn validate(envelope: &Envelope) -> Result<(), CodecError> {
    if envelope.sender.is_empty() {
        return Err(CodecError::MissingSender);
    }
    if let Some(returns) = &envelope.returns {
        if returns.len() > MAX_RETURNS_LEN {
            return Err(CodecError::SeriesTooLong(returns.len()));
        }
        if returns.iter().any(|r| !r.is_finite()) {
            return Err(CodecError::NonFinite);
        }
    }
    if let Some(score) = envelope.score {
        if !score.is_finite() {
            return Err(CodecError::NonFinite);
        }
        if score.abs() > MAX_SCORE_MAGNITUDE {
            return Err(CodecError::ScoreOutOfRange(score));
        }
    }
    if let Some(proof) = &envelope.proof {
        if !proof.score.is_finite() {
            return Err(CodecError::NonFinite);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score_envelope() -> Envelope {
        Envelope {
            kind: MessageType::FarmScore,
            sender: "validator-a".into(),
            request_id: Some("farm-7-1700000000".into()),
            returns: None,
            score: Some(1.689207),
            status: None,
            proof: None,
            listen_port: None,
            timestamp: 1_700_000_000,
            nonce: 42,
        }
    }

    #[test]
    fn round_trip() {
        let envelope = score_envelope();
        let frame = encode(&envelope).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn frame_has_single_newline() {
        let mut envelope = score_envelope();
        envelope.request_id = Some("line\nbreak".into());
        let frame = encode(&envelope).unwrap();
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn message_id_includes_nonce() {
        let mut a = score_envelope();
        let mut b = score_envelope();
        a.nonce = 1;
        b.nonce = 2;
        assert_ne!(a.message_id(), b.message_id());
    }

    #[test]
    fn rejects_unknown_type() {
        let frame = br#"{"type":"mystery","sender":"a","timestamp":0}"#;
        assert!(matches!(decode(frame), Err(CodecError::Parse(_))));
    }

    #[test]
    fn rejects_missing_sender() {
        let frame = br#"{"type":"heartbeat","sender":"","timestamp":0}"#;
        assert!(matches!(decode(frame), Err(CodecError::MissingSender)));
    }

    #[test]
    fn rejects_oversized_series() {
        let mut envelope = score_envelope();
        envelope.kind = MessageType::FarmData;
        envelope.score = None;
        envelope.returns = Some(vec![0.01; MAX_RETURNS_LEN + 1]);
        let frame = encode(&envelope).unwrap();
        assert!(matches!(decode(&frame), Err(CodecError::SeriesTooLong(_))));
    }

    #[test]
    fn rejects_out_of_range_score() {
        let mut envelope = score_envelope();
        envelope.score = Some(2e9);
        let frame = encode(&envelope).unwrap();
        assert!(matches!(decode(&frame), Err(CodecError::ScoreOutOfRange(_))));
    }

    #[test]
    fn rejects_non_finite_returns() {
        // JSON itself cannot carry NaN, so splice the token in by hand.
        let frame = br#"{"type":"farm_data","sender":"a","returns":[1e999],"timestamp":0}"#;
        let result = decode(frame);
        assert!(
            matches!(result, Err(CodecError::Parse(_)) | Err(CodecError::NonFinite)),
            "got {result:?}"
        );
    }

    #[test]
    fn optional_fields_are_omitted() {
        let envelope = Envelope {
            kind: MessageType::Heartbeat,
            sender: "validator-a".into(),
            request_id: None,
            returns: None,
            score: None,
            status: None,
            proof: None,
            listen_port: None,
            timestamp: 1,
            nonce: 0,
        };
        let frame = encode(&envelope).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(!text.contains("request_id"));
        assert!(!text.contains("returns"));
        assert!(!text.contains("score"));
    }
}
