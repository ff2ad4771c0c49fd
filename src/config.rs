//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// Bind address for the combined HTTP/WebSocket listener.
    pub listen_addr: String,
    /// Hex secp256k1 secret key; the relay signs reference events with it.
    pub relay_secret_key: String,
    /// Advertised relay name.
    pub relay_name: String,
    /// Advertised relay description.
    pub relay_description: String,
    /// Advertised contact.
    pub relay_contact: String,
    /// Enable Schnorr signature verification on ingest.
    pub verify_sig: bool,
    /// Per-connection bound on queued outbound frames.
    pub max_outbound_queue: usize,
    /// Limit applied when a filter doesn't carry one.
    pub default_query_limit: usize,
    /// Hard cap on any single query, advertised in the metadata document.
    pub max_query_limit: usize,
    /// Seconds of future `created_at` tolerated on ingest.
    pub clock_skew_future_seconds: u64,
    /// Satellites unseen for longer than this are excluded from routing.
    pub satellite_liveness_seconds: u64,
    /// Period of the expiry sweeper.
    pub expiry_sweep_interval_seconds: u64,
    /// Wall-clock budget for satellite forwarding retries.
    pub forward_retry_ceiling_seconds: u64,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        Ok(Self {
            store_root: PathBuf::from(env::var("STORE_ROOT")?),
            listen_addr: env::var("LISTEN_ADDR")?,
            relay_secret_key: env::var("RELAY_SECRET_KEY")?,
            relay_name: env::var("RELAY_NAME").unwrap_or_else(|_| "fitstr".into()),
            relay_description: env::var("RELAY_DESCRIPTION")
                .unwrap_or_else(|_| "health and fitness event relay".into()),
            relay_contact: env::var("RELAY_CONTACT").unwrap_or_default(),
            verify_sig: env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) == "1",
            max_outbound_queue: parsed("MAX_OUTBOUND_QUEUE", 512),
            default_query_limit: parsed("DEFAULT_QUERY_LIMIT", 100),
            max_query_limit: parsed("MAX_QUERY_LIMIT", 500),
            clock_skew_future_seconds: parsed("CLOCK_SKEW_FUTURE_SECONDS", 900),
            satellite_liveness_seconds: parsed("SATELLITE_LIVENESS_SECONDS", 86_400),
            expiry_sweep_interval_seconds: parsed("EXPIRY_SWEEP_INTERVAL_SECONDS", 3_600),
            forward_retry_ceiling_seconds: parsed("FORWARD_RETRY_CEILING_SECONDS", 60),
        })
    }
}

/// Read an environment variable as a number, falling back to the default
/// when absent or unparsable.
fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
