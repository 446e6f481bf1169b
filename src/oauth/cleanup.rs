//! Background eviction of expired grants and tokens.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use super::store::TokenStore;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Spawn a background task that periodically evicts expired entries.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    token_store: Arc<TokenStore>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let evicted = token_store.evict_expired();
            if evicted > 0 {
                info!(evicted, "Token cleanup completed");
            } else {
                debug!("Token cleanup: nothing expired");
            }

            debug!(
                grants = token_store.grant_count(),
                access_tokens = token_store.access_token_count(),
                refresh_tokens = token_store.refresh_token_count(),
                "Token store status"
            );
        }
    })
}
