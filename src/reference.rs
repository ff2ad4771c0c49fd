//! Relay identity and public reference events for offloaded private data.

use anyhow::{Context, Result};
use secp256k1::{Keypair, Message, Secp256k1};

use crate::event::{event_hash, Event, Tag, REFERENCE_KIND};
use crate::satellite::SatelliteNode;

/// The relay's own signing identity, used for synthesized events.
#[derive(Clone)]
pub struct RelayIdentity {
    keypair: Keypair,
    pubkey: String,
}

impl RelayIdentity {
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret).context("RELAY_SECRET_KEY must be hex")?;
        let secp = Secp256k1::new();
        let keypair =
            Keypair::from_seckey_slice(&secp, &bytes).context("invalid relay secret key")?;
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self { keypair, pubkey })
    }

    /// Hex x-only public key advertised in the metadata document.
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Finalize an event authored by the relay: compute its id and sign.
    pub fn sign(&self, mut ev: Event) -> Result<Event> {
        let hash = event_hash(&ev)?;
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash)?;
        let secp = Secp256k1::new();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }
}

/// Tags copied verbatim from the original onto its reference event.
const SAFE_ECHO_TAGS: [&str; 3] = ["d", "t", "subject"];

/// Build the public pointer event stored locally when `original` is
/// offloaded to `node`. Public by construction; never reclassified.
pub fn synthesize(
    identity: &RelayIdentity,
    original: &Event,
    node: &SatelliteNode,
    now: u64,
) -> Result<Event> {
    let mut tags = vec![
        Tag(vec!["e".into(), original.id.clone()]),
        Tag(vec!["p".into(), original.pubkey.clone()]),
        Tag(vec!["kind".into(), original.kind.to_string()]),
        Tag(vec!["blossom".into(), node.pubkey.clone()]),
        Tag(vec!["url".into(), node.url.clone()]),
    ];
    for Tag(fields) in &original.tags {
        if fields.len() >= 2 && SAFE_ECHO_TAGS.contains(&fields[0].as_str()) {
            tags.push(Tag(fields.clone()));
        }
    }
    let ev = Event {
        id: String::new(),
        pubkey: identity.pubkey.clone(),
        kind: REFERENCE_KIND,
        created_at: now,
        tags,
        content: String::new(),
        sig: String::new(),
    };
    identity.sign(ev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::verify_event;
    use crate::privacy::{classify, PrivacyLevel};

    fn identity() -> RelayIdentity {
        RelayIdentity::from_secret_hex(&"02".repeat(32)).unwrap()
    }

    fn satellite() -> SatelliteNode {
        SatelliteNode {
            pubkey: "cc".repeat(32),
            url: "http://sat.example".into(),
            supported_kinds: vec![32018],
            last_seen: 0,
        }
    }

    fn original() -> Event {
        Event {
            id: "ab".repeat(32),
            pubkey: "aa".repeat(32),
            kind: 32018,
            created_at: 100,
            tags: vec![
                Tag(vec!["d".into(), "slug".into()]),
                Tag(vec!["privacy".into(), "private".into()]),
                Tag(vec!["t".into(), "sleep".into()]),
                Tag(vec!["subject".into(), "night".into()]),
            ],
            content: "secret".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn identity_rejects_bad_secrets() {
        assert!(RelayIdentity::from_secret_hex("not hex").is_err());
        assert!(RelayIdentity::from_secret_hex("0102").is_err());
        assert_eq!(identity().pubkey().len(), 64);
    }

    #[test]
    fn reference_points_at_original_and_satellite() {
        let r = synthesize(&identity(), &original(), &satellite(), 200).unwrap();
        assert_eq!(r.kind, REFERENCE_KIND);
        assert_eq!(r.created_at, 200);
        assert_eq!(r.pubkey, identity().pubkey());
        assert_eq!(r.tag_value("e"), Some("ab".repeat(32)).as_deref());
        assert_eq!(r.tag_value("p"), Some("aa".repeat(32)).as_deref());
        assert_eq!(r.tag_value("kind"), Some("32018"));
        assert_eq!(r.tag_value("blossom"), Some("cc".repeat(32)).as_deref());
        assert_eq!(r.tag_value("url"), Some("http://sat.example"));
        assert!(r.content.is_empty());
    }

    #[test]
    fn reference_echoes_only_safe_tags() {
        let r = synthesize(&identity(), &original(), &satellite(), 200).unwrap();
        assert_eq!(r.tag_value("d"), Some("slug"));
        assert_eq!(r.tag_value("t"), Some("sleep"));
        assert_eq!(r.tag_value("subject"), Some("night"));
        assert_eq!(r.tag_value("privacy"), None);
    }

    #[test]
    fn reference_is_signed_and_public() {
        let r = synthesize(&identity(), &original(), &satellite(), 200).unwrap();
        verify_event(&r).unwrap();
        assert_eq!(classify(&r), PrivacyLevel::Public);
    }

    #[test]
    fn sign_is_deterministic_for_same_input() {
        let id = identity();
        let a = synthesize(&id, &original(), &satellite(), 200).unwrap();
        let b = synthesize(&id, &original(), &satellite(), 200).unwrap();
        assert_eq!(a, b);
    }
}
