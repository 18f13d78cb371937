//! Long-lived background tasks. All are cancellable through the shared
//! shutdown watch channel.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;

use crate::manager::INVALIDATE_CHANNEL;
use crate::state::AppState;

/// Periodically persists the lazy staleness decay and drops long-idle
/// weight triples.
pub async fn weight_decay_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let interval =
            Duration::from_secs(state.manager.defaults().weight_decay_interval_secs.max(10));
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        match state.weights.decay_stale(OffsetDateTime::now_utc()).await {
            Ok(touched) if touched > 0 => {
                tracing::debug!(touched, "weight decay pass");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "weight decay pass failed"),
        }
    }
}

/// Applies group-cache invalidations broadcast by peers through the store.
/// Re-subscribes with backoff when the channel drops (shared backing lost).
pub async fn invalidation_subscriber(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let mut rx = match state.store.subscribe(INVALIDATE_CHANNEL).await {
            Ok(rx) => rx,
            Err(err) => {
                tracing::warn!(error = %err, "invalidation subscribe failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    _ = shutdown.changed() => return,
                }
            }
        };

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(_) => {
                            if let Err(err) = state.manager.reload(&state.cipher).await {
                                tracing::warn!(error = %err, "group cache reload failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}
