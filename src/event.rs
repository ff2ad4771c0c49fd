//! Event model, canonical hashing, and publish-side validation.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core event persisted on disk and served to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1301` or `33401`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// NIP-101e workout record.
pub const WORKOUT_RECORD_KIND: u32 = 1301;
/// NIP-101e exercise template.
pub const EXERCISE_TEMPLATE_KIND: u32 = 33401;
/// NIP-101e workout template.
pub const WORKOUT_TEMPLATE_KIND: u32 = 33402;
/// Inclusive lower bound of the health metric kind range.
pub const HEALTH_KIND_MIN: u32 = 32018;
/// Inclusive upper bound of the health metric kind range.
pub const HEALTH_KIND_MAX: u32 = 32048;
/// Kind of relay-synthesized reference events pointing at satellite data.
pub const REFERENCE_KIND: u32 = 30078;

impl Event {
    /// Second element of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|Tag(fields)| match fields.as_slice() {
                [n, v, ..] if n == name => Some(v.as_str()),
                _ => None,
            })
    }
}

/// Whether clients may publish events of this kind.
pub fn kind_allowed(kind: u32) -> bool {
    matches!(
        kind,
        WORKOUT_RECORD_KIND | EXERCISE_TEMPLATE_KIND | WORKOUT_TEMPLATE_KIND
    ) || (HEALTH_KIND_MIN..=HEALTH_KIND_MAX).contains(&kind)
}

/// Current Unix timestamp in seconds.
pub fn now_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Recompute the canonical event hash from its fields.
///
/// The preimage is the JSON array `[0, pubkey, created_at, kind, tags,
/// content]` serialized without whitespace; tag order participates in the
/// hash byte-for-byte.
pub fn event_hash(ev: &Event) -> anyhow::Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Rejection reasons surfaced to clients in `OK` frames.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid: malformed event: {0}")]
    Format(String),
    #[error("invalid: id mismatch")]
    Id,
    #[error("invalid: signature verification failed")]
    Sig,
    #[error("unsupported: kind {0} not accepted")]
    Kind(u32),
    #[error("invalid: created_at too far in the future")]
    ClockSkew,
}

/// Publish-side validator: field shape, kind allow-list, clock skew,
/// canonical hash, and Schnorr signature. Pure and side-effect-free.
#[derive(Debug, Clone)]
pub struct Validator {
    /// Seconds of future `created_at` tolerated on ingest.
    pub clock_skew_future: u64,
    /// Enable Schnorr signature verification.
    pub verify_sig: bool,
}

impl Validator {
    pub fn validate(&self, ev: &Event, now: u64) -> Result<(), ValidationError> {
        if ev.id.len() != 64 || hex::decode(&ev.id).is_err() {
            return Err(ValidationError::Format("id must be 32 bytes of hex".into()));
        }
        if ev.pubkey.len() != 64 || hex::decode(&ev.pubkey).is_err() {
            return Err(ValidationError::Format(
                "pubkey must be 32 bytes of hex".into(),
            ));
        }
        if !kind_allowed(ev.kind) {
            return Err(ValidationError::Kind(ev.kind));
        }
        // Reject far-future timestamps; arbitrarily old ones are fine.
        if ev.created_at > now + self.clock_skew_future {
            return Err(ValidationError::ClockSkew);
        }
        let hash = event_hash(ev).map_err(|e| ValidationError::Format(e.to_string()))?;
        if hex::encode(hash) != ev.id {
            return Err(ValidationError::Id);
        }
        if self.verify_sig {
            verify_schnorr(ev, &hash)?;
        }
        Ok(())
    }
}

/// Verify an event's id and Schnorr signature, for offline tooling.
pub fn verify_event(ev: &Event) -> anyhow::Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        anyhow::bail!("id mismatch");
    }
    verify_schnorr(ev, &hash)?;
    Ok(())
}

fn verify_schnorr(ev: &Event, hash: &[u8; 32]) -> Result<(), ValidationError> {
    let sig_bytes = hex::decode(&ev.sig).map_err(|_| ValidationError::Sig)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| ValidationError::Sig)?;
    let pk_bytes = hex::decode(&ev.pubkey).map_err(|_| ValidationError::Sig)?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(|_| ValidationError::Sig)?;
    let msg = Message::from_digest_slice(hash).map_err(|_| ValidationError::Sig)?;
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| ValidationError::Sig)
}
