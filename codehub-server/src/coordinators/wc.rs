//! The Workspace Controller (spec §4.H): the heart of convergence. Loads
//! candidates, runs Judge+Planner per row, executes the Runtime side effect
//! the Planner selected, and persists with a compare-and-set on `operation`
//! so a sibling WC replica racing the same row never clobbers it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sqlx::PgConnection;
use tracing::{info, warn};

use codehub_core::circuit_breaker::{CallError, CircuitBreaker};
use codehub_core::coordinator::{Coordinator, NotifyPublisher, WakeTarget};
use codehub_core::database::WorkspaceRepo;
use codehub_core::domain::{Operation, Workspace};
use codehub_core::error::{CoreError, Result};
use codehub_core::planner::{needs_execute, plan, PlanAction, PlanInput};

/// Bounded fan-out for the per-workspace Runtime calls within one tick (spec
/// §4.H step 2, §5): execution runs concurrently, persistence stays serial
/// on the one connection this coordinator owns.
const EXECUTE_CONCURRENCY: usize = 8;

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;
const CIRCUIT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WcCoordinator {
    runtime: Arc<dyn codehub_core::runtime::WorkspaceRuntime>,
    publisher: NotifyPublisher,
    circuit: Arc<CircuitBreaker>,
    operation_timeout: chrono::Duration,
}

impl WcCoordinator {
    pub fn new(
        runtime: Arc<dyn codehub_core::runtime::WorkspaceRuntime>,
        publisher: NotifyPublisher,
        operation_timeout_seconds: i64,
    ) -> Self {
        Self {
            runtime,
            publisher,
            circuit: Arc::new(CircuitBreaker::new(
                "external",
                CIRCUIT_FAILURE_THRESHOLD,
                CIRCUIT_SUCCESS_THRESHOLD,
                CIRCUIT_OPEN_TIMEOUT,
            )),
            operation_timeout: chrono::Duration::seconds(operation_timeout_seconds),
        }
    }

    fn plan_input(workspace: &Workspace) -> PlanInput {
        PlanInput {
            phase: workspace.phase,
            operation: workspace.operation,
            desired_state: workspace.desired_state,
            conditions: workspace.conditions.clone(),
            archive_key: workspace.archive_key.clone(),
            op_started_at: workspace.op_started_at,
            archive_op_id: workspace.archive_op_id,
            deleted: workspace.is_deleted(),
        }
    }

    /// Executes the Runtime side effects for `action.operation`, returning a
    /// freshly captured `archive_key` when the operation produces one. The
    /// archiving contract order (archive -> stop -> delete volume) is
    /// mandatory: the volume must never be removed before the archive is
    /// durably committed (spec §4.H operation table).
    async fn execute(&self, workspace: &Workspace, action: &PlanAction) -> Result<Option<String>> {
        let id = workspace.id;
        let runtime = self.runtime.clone();
        let circuit = self.circuit.clone();

        let run = |op: Operation, archive_op_id: Option<codehub_core::ids::OpId>, image_ref: String, archive_key: Option<String>| {
            let runtime = runtime.clone();
            async move {
                match op {
                    Operation::Provisioning => runtime.provision(id).await.map(|_| None),
                    Operation::Starting => runtime.start(id, &image_ref).await.map(|_| None),
                    Operation::Stopping => runtime.stop(id).await.map(|_| None),
                    Operation::Archiving => {
                        let op_id = archive_op_id.ok_or_else(|| {
                            CoreError::InvalidState("ARCHIVING requires an archive_op_id".into())
                        })?;
                        let key = runtime.archive(id, op_id).await?;
                        runtime.stop(id).await?;
                        runtime.delete(id).await?;
                        Ok(Some(key))
                    }
                    Operation::Restoring => {
                        let key = archive_key.ok_or_else(|| {
                            CoreError::InvalidState("RESTORING requires a stored archive_key".into())
                        })?;
                        runtime.restore(id, &key).await.map(|_| None)
                    }
                    Operation::CreateEmptyArchive => {
                        let op_id = archive_op_id.ok_or_else(|| {
                            CoreError::InvalidState("CREATE_EMPTY_ARCHIVE requires an archive_op_id".into())
                        })?;
                        runtime.create_empty_archive(id, op_id).await.map(Some)
                    }
                    Operation::Deleting => runtime.delete(id).await.map(|_| None),
                    Operation::None => Ok(None),
                }
            }
        };

        let archive_op_id = action.archive_op_id.or(workspace.archive_op_id);
        let archive_key = workspace.archive_key.clone();
        let image_ref = workspace.image_ref.clone();
        let op = action.operation;

        // Permanent runtime failures (bad input, access denied) say nothing
        // about the dependency's health, so they must not count toward the
        // breaker the way a flaky one does (spec §7).
        circuit
            .call_classified(move || run(op, archive_op_id, image_ref, archive_key), CoreError::class)
            .await
            .map_err(|err| match err {
                CallError::CircuitOpen(open) => {
                    CoreError::CircuitOpen { service: open.service, retry_after_secs: open.retry_after_secs }
                }
                CallError::Inner(inner) => inner,
            })
    }
}

#[async_trait]
impl Coordinator for WcCoordinator {
    const LOCK_KEY: &'static str = "wc";
    const WAKE_TARGET: Option<WakeTarget> = Some(WakeTarget::Wc);

    async fn tick(&mut self, conn: &mut PgConnection) -> Result<()> {
        let candidates = WorkspaceRepo::load_reconcile_candidates(conn).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let planned: Vec<(Workspace, PlanAction)> = candidates
            .into_iter()
            .map(|workspace| {
                let input = Self::plan_input(&workspace);
                let action = plan(&input, self.operation_timeout, now);
                (workspace, action)
            })
            .collect();

        // Execution phase: concurrent, bounded, and side-effect only -- no
        // connection access happens inside these futures.
        let executed: Vec<(Workspace, PlanAction)> = stream::iter(planned)
            .map(|(workspace, mut action)| {
                let needs = needs_execute(&action, workspace.operation);
                async move {
                    if needs {
                        match self.execute(&workspace, &action).await {
                            Ok(Some(key)) => action.archive_key = Some(key),
                            Ok(None) => {}
                            Err(err) => {
                                warn!(workspace_id = %workspace.id, operation = ?action.operation, error = %err, "runtime execution failed, will retry next tick");
                            }
                        }
                    }
                    (workspace, action)
                }
            })
            .buffer_unordered(EXECUTE_CONCURRENCY)
            .collect()
            .await;

        // Persistence phase: serial CAS writes on the one connection this
        // coordinator owns (spec §4.H step 3 / §5).
        let mut any_changed = false;
        for (workspace, action) in executed {
            let state_changed = action.operation != workspace.operation || action.phase != workspace.phase;
            let applied =
                WorkspaceRepo::cas_apply_plan(conn, workspace.id, workspace.operation, &action, now).await?;
            if !applied {
                warn!(workspace_id = %workspace.id, "CAS mismatch, workspace changed under us, retrying next tick");
                continue;
            }
            if state_changed {
                any_changed = true;
            }
        }

        if any_changed {
            if let Err(err) = self.publisher.publish(WakeTarget::Ob).await {
                warn!(error = %err, "failed to publish ob wake after wc tick");
            }
            info!("wc tick applied state changes");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codehub_core::domain::{Conditions, DesiredState, Phase};
    use codehub_core::ids::{UserId, WorkspaceId};

    fn fixture_workspace() -> Workspace {
        Workspace {
            id: WorkspaceId::new(),
            owner_user_id: UserId::new(),
            name: "scratch".into(),
            description: String::new(),
            memo: String::new(),
            image_ref: "codehub/base:latest".into(),
            home_store_key: "home/scratch".into(),
            conditions: Conditions::default(),
            observed_at: None,
            phase: Phase::Pending,
            operation: Operation::None,
            op_started_at: None,
            op_id: None,
            archive_op_id: None,
            archive_key: None,
            error_reason: None,
            error_count: 0,
            phase_changed_at: None,
            desired_state: DesiredState::Running,
            last_access_at: None,
            deleted_at: None,
            standby_ttl_seconds: 1800,
            archive_ttl_seconds: 86400,
        }
    }

    #[test]
    fn plan_input_mirrors_the_workspace_columns_the_planner_reads() {
        let workspace = fixture_workspace();
        let input = WcCoordinator::plan_input(&workspace);
        assert_eq!(input.phase, workspace.phase);
        assert_eq!(input.operation, workspace.operation);
        assert_eq!(input.desired_state, workspace.desired_state);
        assert_eq!(input.archive_key, workspace.archive_key);
        assert_eq!(input.op_started_at, workspace.op_started_at);
        assert_eq!(input.archive_op_id, workspace.archive_op_id);
        assert!(!input.deleted);
    }

    #[test]
    fn plan_input_reflects_deleted_workspaces() {
        let mut workspace = fixture_workspace();
        workspace.deleted_at = Some(Utc::now());
        let input = WcCoordinator::plan_input(&workspace);
        assert!(input.deleted);
    }
}
