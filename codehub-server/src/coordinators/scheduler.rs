//! The Scheduler coordinator (spec §4.I): the sole writer of `desired_state`
//! transitions driven by TTL expiry, plus periodic orphan reclamation. Two
//! independent schedules share one tick loop by elapsed wall time rather
//! than running as separate coordinators, since neither needs its own
//! leader election lock beyond the one this coordinator already holds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use sqlx::PgConnection;
use tracing::{info, warn};

use codehub_core::coordinator::{Coordinator, NotifyPublisher, WakeTarget};
use codehub_core::database::WorkspaceRepo;
use codehub_core::error::Result;
use codehub_core::runtime::WorkspaceRuntime;

/// Elapsed-time gates for the two schedules within one shared tick (spec
/// §4.I): both default intervals come straight from the spec text, not an
/// env var -- nothing in §6's configuration surface names them.
const TTL_INTERVAL: Duration = Duration::from_secs(60);
const GC_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// A schedule with no prior run is due immediately (spec §4.I: both
/// schedules fire on the coordinator's first tick after startup).
fn is_due(last_run: Option<Instant>, interval: Duration) -> bool {
    last_run.map(|t| t.elapsed() >= interval).unwrap_or(true)
}

pub struct SchedulerCoordinator {
    runtime: Arc<dyn WorkspaceRuntime>,
    publisher: NotifyPublisher,
    redis: redis::aio::ConnectionManager,
    resource_prefix: String,
    last_ttl: Option<Instant>,
    last_gc: Option<Instant>,
}

impl SchedulerCoordinator {
    pub fn new(
        runtime: Arc<dyn WorkspaceRuntime>,
        publisher: NotifyPublisher,
        redis: redis::aio::ConnectionManager,
        resource_prefix: String,
    ) -> Self {
        Self { runtime, publisher, redis, resource_prefix, last_ttl: None, last_gc: None }
    }

    fn ttl_due(&self) -> bool {
        is_due(self.last_ttl, TTL_INTERVAL)
    }

    fn gc_due(&self) -> bool {
        is_due(self.last_gc, GC_INTERVAL)
    }

    /// Step 1 of TTL: drains every `last_access:{id}` key in Redis into
    /// Postgres in one bulk statement, then deletes exactly the keys whose
    /// row actually matched (spec §4.I step 1, §4.K step 3).
    async fn sync_last_access(&mut self, conn: &mut PgConnection) -> Result<usize> {
        let keys: Vec<String> = self.redis.keys("last_access:*").await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(keys.len());
        let mut timestamps = Vec::with_capacity(keys.len());
        let mut key_by_id = std::collections::HashMap::with_capacity(keys.len());
        for key in &keys {
            let Some(raw_id) = key.strip_prefix("last_access:") else { continue };
            let Ok(id) = raw_id.parse::<codehub_core::ids::WorkspaceId>() else {
                warn!(key = %key, "unparseable last_access key, skipping");
                continue;
            };
            let value: Option<String> = self.redis.get(key).await?;
            let Some(value) = value else { continue };
            let Ok(unix_seconds) = value.parse::<f64>() else {
                warn!(key = %key, value = %value, "non-numeric last_access value, skipping");
                continue;
            };
            let Some(ts) = chrono::DateTime::from_timestamp(unix_seconds as i64, 0) else { continue };
            key_by_id.insert(id, key.clone());
            ids.push(id);
            timestamps.push(ts);
        }

        if ids.is_empty() {
            return Ok(0);
        }

        let updated = WorkspaceRepo::bulk_sync_last_access(conn, &ids, &timestamps).await?;
        if !updated.is_empty() {
            let matched_keys: Vec<&String> =
                updated.iter().filter_map(|id| key_by_id.get(id)).collect();
            if !matched_keys.is_empty() {
                let _: () = self.redis.del(matched_keys).await?;
            }
        }
        Ok(updated.len())
    }

    async fn run_ttl(&mut self, conn: &mut PgConnection) -> Result<()> {
        self.sync_last_access(conn).await?;

        let now = Utc::now();
        let standby = WorkspaceRepo::demote_idle_running_to_standby(conn, now).await?;
        let archived = WorkspaceRepo::demote_idle_standby_to_archived(conn, now).await?;
        let changed = standby.len() + archived.len();

        if changed > 0 {
            info!(standby = standby.len(), archived = archived.len(), "scheduler demoted idle workspaces");
            if let Err(err) = self.publisher.publish(WakeTarget::Wc).await {
                warn!(error = %err, "failed to publish wc wake after ttl demotion");
            }
        }
        self.last_ttl = Some(Instant::now());
        Ok(())
    }

    async fn run_gc(&mut self, conn: &mut PgConnection) -> Result<()> {
        let (protected_keys, protected_workspaces) =
            WorkspaceRepo::load_protected_resources(conn, &self.resource_prefix).await?;

        match self.runtime.run_gc(&protected_keys, &protected_workspaces).await {
            Ok(result) => {
                if result.deleted_count > 0 {
                    info!(deleted = result.deleted_count, "scheduler gc reaped orphan archives");
                }
            }
            Err(err) => warn!(error = %err, "archive gc failed"),
        }

        match self.runtime.observe().await {
            Ok(observed) => {
                let active = WorkspaceRepo::load_active_ids(conn).await?;
                let active: std::collections::HashSet<_> = active.into_iter().collect();
                for id in observed.keys() {
                    if !active.contains(id) {
                        if let Err(err) = self.runtime.delete(*id).await {
                            warn!(workspace_id = %id, error = %err, "failed to delete orphan container/volume");
                        } else {
                            info!(workspace_id = %id, "scheduler gc reaped orphan container/volume");
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "runtime observe failed during gc"),
        }

        self.last_gc = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl Coordinator for SchedulerCoordinator {
    const LOCK_KEY: &'static str = "scheduler";
    const WAKE_TARGET: Option<WakeTarget> = None;

    async fn tick(&mut self, conn: &mut PgConnection) -> Result<()> {
        if self.ttl_due() {
            self.run_ttl(conn).await?;
        }
        if self.gc_due() {
            self.run_gc(conn).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_with_no_prior_run_is_due_immediately() {
        assert!(is_due(None, TTL_INTERVAL));
        assert!(is_due(None, GC_INTERVAL));
    }

    #[test]
    fn schedule_not_due_before_its_interval_elapses() {
        let last_run = Instant::now();
        assert!(!is_due(Some(last_run), Duration::from_secs(60)));
    }

    #[test]
    fn schedule_due_once_its_interval_has_elapsed() {
        let last_run = Instant::now() - Duration::from_secs(61);
        assert!(is_due(Some(last_run), Duration::from_secs(60)));
    }

    #[test]
    fn ttl_and_gc_intervals_are_ordered_as_the_spec_describes() {
        // TTL runs far more often than GC (spec §4.I: every tick vs every few hours).
        assert!(TTL_INTERVAL < GC_INTERVAL);
    }
}
