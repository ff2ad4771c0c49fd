//! Timer-driven expiry sweeping.

use std::time::Duration;

use crate::event::now_ts;
use crate::storage::Store;

/// Periodically delete events whose `expires_at` tag has passed.
/// Subscribers are not told; they observe the absence on later queries.
pub async fn run(store: Store, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; skip it so the sweep runs on
    // the configured cadence
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.delete_expired(now_ts()) {
            Ok(0) => {}
            Ok(n) => tracing::info!(deleted = n, "expiry sweep removed events"),
            Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
        }
    }
}
