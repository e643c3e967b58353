//! Wire format for mesh heartbeats and deltas
//!
//! Heartbeats sign the decimal timestamp string exactly as sent. Deltas sign
//! a canonical string built from the envelope; which fields it covers depends
//! on the `SignatureScheme` both nodes are configured with.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `POST /mesh/heartbeat` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub timestamp: String,
    /// Hex signature over the timestamp bytes.
    pub signature: String,
    /// Hex public key of the sender.
    pub public_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub origin_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: f64,
}

/// `POST /mesh/sync` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaRequest {
    pub envelope: SyncEnvelope,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaResponse {
    pub status: String,
    pub origin: String,
}

/// Body of any non-2xx mesh response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Decimal form of a timestamp as older nodes print it: whole numbers keep a
/// trailing `.0`.
pub fn format_timestamp(timestamp: f64) -> String {
    if timestamp.is_finite() && timestamp.fract() == 0.0 {
        format!("{:.1}", timestamp)
    } else {
        timestamp.to_string()
    }
}

/// What a delta signature covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// `origin:timestamp:event_type`; the payload is not covered.
    Legacy,
    /// `origin:timestamp:event_type:sha256(payload)` over compact JSON with sorted keys.
    #[default]
    EnvelopeDigest,
}

impl SignatureScheme {
    pub fn signing_bytes(&self, envelope: &SyncEnvelope) -> Vec<u8> {
        let header = format!(
            "{}:{}:{}",
            envelope.origin_id,
            format_timestamp(envelope.timestamp),
            envelope.event_type
        );

        match self {
            SignatureScheme::Legacy => header.into_bytes(),
            SignatureScheme::EnvelopeDigest => {
                // serde_json maps are ordered by key, so this is canonical
                let body = serde_json::to_vec(&envelope.payload).unwrap_or_default();
                let digest = hex::encode(Sha256::digest(&body));
                format!("{}:{}", header, digest).into_bytes()
            }
        }
    }
}
