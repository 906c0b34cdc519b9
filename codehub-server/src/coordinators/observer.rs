//! The Observer coordinator (spec §4.G): the sole writer of `conditions`.
//! Every tick is read-observe-write, never conditional on anything but the
//! Runtime's own report, which is what lets it recover cleanly from a crash
//! mid-tick -- there is no partial state to resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgConnection;
use tracing::{info, warn};

use codehub_core::coordinator::{Coordinator, NotifyPublisher, WakeTarget};
use codehub_core::database::WorkspaceRepo;
use codehub_core::domain::{ArchiveCondition, Conditions, RestoreCondition};
use codehub_core::error::Result;
use codehub_core::ids::WorkspaceId;
use codehub_core::runtime::{ObservedWorkspace, WorkspaceRuntime};

/// `observe()` must never be allowed to hang a tick forever; a timeout here
/// is a pure skip (spec §8 boundary behaviors), not an error.
const OBSERVE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ObserverCoordinator {
    runtime: Arc<dyn WorkspaceRuntime>,
    publisher: NotifyPublisher,
}

impl ObserverCoordinator {
    pub fn new(runtime: Arc<dyn WorkspaceRuntime>, publisher: NotifyPublisher) -> Self {
        Self { runtime, publisher }
    }
}

fn conditions_for(id: WorkspaceId, observed: &HashMap<WorkspaceId, ObservedWorkspace>) -> Conditions {
    let Some(ob) = observed.get(&id) else {
        return Conditions::default();
    };
    Conditions {
        container: ob.container,
        volume: ob.volume,
        archive: ob.archive.as_ref().map(|a| ArchiveCondition {
            exists: a.exists,
            archive_key: a.archive_key.clone(),
            failure_reason: a.failure_reason,
        }),
        restore: ob.restore_marker.as_ref().map(|key| RestoreCondition { archive_key: Some(key.clone()) }),
    }
}

#[async_trait]
impl Coordinator for ObserverCoordinator {
    const LOCK_KEY: &'static str = "observer";
    const WAKE_TARGET: Option<WakeTarget> = Some(WakeTarget::Ob);

    async fn tick(&mut self, conn: &mut PgConnection) -> Result<()> {
        let active_ids = WorkspaceRepo::load_active_ids(conn).await?;
        if active_ids.is_empty() {
            return Ok(());
        }

        let observed = match tokio::time::timeout(OBSERVE_TIMEOUT, self.runtime.observe()).await {
            Ok(Ok(observed)) => observed,
            Ok(Err(err)) => {
                warn!(error = %err, "runtime observe failed, skipping tick");
                return Ok(());
            }
            Err(_) => {
                warn!(timeout_secs = OBSERVE_TIMEOUT.as_secs(), "runtime observe timed out, skipping tick");
                return Ok(());
            }
        };

        let now = Utc::now();
        let updates: Vec<_> = active_ids
            .iter()
            .map(|&id| (id, conditions_for(id, &observed), now))
            .collect();

        let changed = WorkspaceRepo::bulk_update_conditions(conn, &updates).await?;
        if changed > 0 {
            if let Err(err) = self.publisher.publish(WakeTarget::Wc).await {
                warn!(error = %err, "failed to publish wc wake after observer tick");
            }
            info!(updated = changed, "observer tick updated conditions");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codehub_core::domain::{ContainerCondition, VolumeCondition};
    use codehub_core::runtime::ObservedArchive;

    #[test]
    fn unobserved_workspace_gets_default_conditions() {
        let observed = HashMap::new();
        let conditions = conditions_for(WorkspaceId::new(), &observed);
        assert_eq!(conditions, Conditions::default());
    }

    #[test]
    fn observed_workspace_maps_every_resource() {
        let id = WorkspaceId::new();
        let mut observed = HashMap::new();
        observed.insert(
            id,
            ObservedWorkspace {
                container: Some(ContainerCondition { running: true, healthy: true }),
                volume: Some(VolumeCondition { exists: true }),
                archive: Some(ObservedArchive {
                    exists: true,
                    archive_key: Some("codehub-ws-w1/op1/home.tar.zst".into()),
                    failure_reason: None,
                }),
                restore_marker: Some("codehub-ws-w1/op2/home.tar.zst".into()),
            },
        );

        let conditions = conditions_for(id, &observed);
        assert!(conditions.container_ready());
        assert!(conditions.volume_ready());
        assert!(conditions.archive_ready());
        assert_eq!(conditions.archive_key(), Some("codehub-ws-w1/op1/home.tar.zst"));
        assert_eq!(
            conditions.restore.as_ref().and_then(|r| r.archive_key.as_deref()),
            Some("codehub-ws-w1/op2/home.tar.zst")
        );
    }

    #[test]
    fn archive_failure_reason_is_carried_through() {
        let id = WorkspaceId::new();
        let mut observed = HashMap::new();
        observed.insert(
            id,
            ObservedWorkspace {
                container: None,
                volume: None,
                archive: Some(ObservedArchive {
                    exists: false,
                    archive_key: None,
                    failure_reason: Some(codehub_core::domain::ArchiveFailureReason::Corrupted),
                }),
                restore_marker: None,
            },
        );

        let conditions = conditions_for(id, &observed);
        assert!(!conditions.archive_ready());
        assert_eq!(
            conditions.archive_failure_reason(),
            Some(codehub_core::domain::ArchiveFailureReason::Corrupted)
        );
    }
}
