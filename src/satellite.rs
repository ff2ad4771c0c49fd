//! Satellite node registry and private-event forwarding.
//!
//! Satellites are external nodes that store PRIVATE events on the relay's
//! behalf. Registrations are durable: one JSON record per pubkey under
//! `<store_root>/satellites/`, reloaded before the relay starts accepting
//! events so routing survives restarts.

use std::{collections::HashMap, fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::event::{now_ts, Event};
use crate::subs::{ConnQueue, Frame};

/// A registered satellite node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SatelliteNode {
    /// Node identity (hex public key).
    pub pubkey: String,
    /// Reachable base URL.
    pub url: String,
    /// Event kinds the node accepts.
    pub supported_kinds: Vec<u32>,
    /// Unix timestamp of the last registration or heartbeat.
    pub last_seen: u64,
}

/// Durable registry of satellite nodes, keyed by pubkey. Reads share a
/// lock; registration writes are serialized.
#[derive(Clone)]
pub struct SatelliteRegistry {
    dir: PathBuf,
    liveness: u64,
    nodes: Arc<RwLock<HashMap<String, SatelliteNode>>>,
}

impl SatelliteRegistry {
    /// Load every persisted node record from `dir`.
    pub fn load(dir: PathBuf, liveness: u64) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut nodes = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read_to_string(entry.path())?;
            let node: SatelliteNode = serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", entry.path().display()))?;
            nodes.insert(node.pubkey.clone(), node);
        }
        Ok(Self {
            dir,
            liveness,
            nodes: Arc::new(RwLock::new(nodes)),
        })
    }

    /// Upsert a node record, stamping its last-seen time, and persist it.
    pub fn register(&self, mut node: SatelliteNode) -> Result<()> {
        node.last_seen = now_ts();
        let path = self.dir.join(format!("{}.json", node.pubkey));
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&tmp, &node)?;
        tmp.persist(path)?;
        self.nodes.write().insert(node.pubkey.clone(), node);
        Ok(())
    }

    /// Pick the satellite for a private event: an explicit live `blossom`
    /// tag target wins, otherwise the first live node supporting the
    /// event's kind (lowest pubkey, for determinism).
    pub fn route(&self, ev: &Event, now: u64) -> Option<SatelliteNode> {
        let nodes = self.nodes.read();
        if let Some(target) = ev.tag_value("blossom") {
            if let Some(node) = nodes.get(target) {
                if self.live(node, now) {
                    return Some(node.clone());
                }
            }
        }
        let mut live: Vec<SatelliteNode> = nodes
            .values()
            .filter(|n| self.live(n, now))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        live.into_iter().find(|n| n.supported_kinds.contains(&ev.kind))
    }

    /// Snapshot of currently-live nodes, most recently seen first.
    pub fn list(&self, now: u64) -> Vec<SatelliteNode> {
        let nodes = self.nodes.read();
        let mut out: Vec<SatelliteNode> = nodes
            .values()
            .filter(|n| self.live(n, now))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.pubkey.cmp(&b.pubkey))
        });
        out
    }

    fn live(&self, node: &SatelliteNode, now: u64) -> bool {
        now.saturating_sub(node.last_seen) <= self.liveness
    }
}

/// Forward a private event to its satellite, retrying with exponential
/// backoff until the wall-clock ceiling. Forwarding is asynchronous with
/// respect to the PUBLISH acknowledgement; on exhaustion the event is
/// dropped and the originating connection is notified if still open.
pub async fn forward(event: Event, node: SatelliteNode, queue: ConnQueue, ceiling: Duration) {
    let client = reqwest::Client::new();
    let url = format!("{}/events", node.url.trim_end_matches('/'));
    let start = tokio::time::Instant::now();
    let mut delay = Duration::from_secs(1);
    loop {
        match client.post(&url).json(&event).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(id = %event.id, url = %node.url, "forwarded private event");
                return;
            }
            Ok(resp) => {
                tracing::warn!(id = %event.id, status = %resp.status(), "satellite rejected event")
            }
            Err(e) => tracing::warn!(id = %event.id, error = %e, "satellite unreachable"),
        }
        if start.elapsed() + delay > ceiling {
            tracing::warn!(id = %event.id, url = %node.url, "dropping private event after retries");
            queue.push(Frame::Notice {
                message: format!("could not forward event {} to satellite", event.id),
            });
            return;
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}
