//! Stage 2 of the activity pipeline (spec §4.K step 2): a background task
//! that periodically drains the in-process `ActivityBuffer` into Redis.
//! Stage 3 (Redis -> `last_access_at`) is Scheduler's `sync_last_access`.

use std::time::Duration;

use redis::AsyncCommands;

use crate::state::AppState;

const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Runs until `shutdown` fires. Intended to be spawned once per process
/// alongside the coordinator loops.
pub async fn run(state: AppState, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => return,
        }

        let mut redis = state.redis.clone();
        let flushed = state
            .activity
            .flush(|snapshot| async move {
                if snapshot.is_empty() {
                    return Ok(());
                }
                let pairs: Vec<(String, f64)> = snapshot
                    .into_iter()
                    .map(|(id, ts)| {
                        let unix_seconds = ts
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_secs_f64())
                            .unwrap_or(0.0);
                        (format!("last_access:{id}"), unix_seconds)
                    })
                    .collect();
                redis.mset(&pairs).await.map_err(codehub_core::error::CoreError::from)
            })
            .await;

        if flushed > 0 {
            tracing::debug!(flushed, "activity buffer flushed to redis");
        }
    }
}
