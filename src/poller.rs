use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

const TICK: Duration = Duration::from_secs(60);
const INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Feed polling loop. Wakes every minute and refreshes the feeds that are due.
///
/// A failed refresh is not retried early; the next due poll is the retry.
pub async fn polling_loop(engine: Arc<Engine>, cancel: CancellationToken) {
    let sources = engine.feeds().sources();
    if sources.is_empty() {
        debug!("no feeds configured, poller idle");
        return;
    }
    info!(feeds = sources.len(), "feed poller started");

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(INITIAL_DELAY) => {}
    }

    let mut last_polled: HashMap<String, Instant> = HashMap::new();
    loop {
        for (source, interval) in &sources {
            if let Some(at) = last_polled.get(source)
                && at.elapsed() < *interval
            {
                continue;
            }
            if cancel.is_cancelled() {
                return;
            }

            last_polled.insert(source.clone(), Instant::now());
            match engine.refresh_feed(source, None).await {
                Ok(refresh) if refresh.fallback.is_none() => {
                    info!(feed = %source, new_items = refresh.new_items, "polled feed")
                }
                Ok(refresh) => debug!(feed = %source, message = %refresh.message, "polled feed, serving cache"),
                Err(e) => warn!(feed = %source, error = %e, "feed poll failed"),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("feed poller shutting down");
                return;
            }
            _ = tokio::time::sleep(TICK) => {}
        }
    }
}
