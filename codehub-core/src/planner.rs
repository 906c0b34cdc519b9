//! Pure operation selection. Planner turns a workspace view plus Judge's
//! verdict into the next `PlanAction`. Like Judge, it never reads the clock
//! except through the explicit `now`/`timeout` parameters passed in -- see
//! spec §4.F / §9.

use chrono::{DateTime, Utc};

use crate::domain::{Conditions, DesiredState, ErrorReason, Operation, Phase};
use crate::ids::OpId;
use crate::judge::{judge, JudgeInput, JudgeOutput};

/// The subset of a workspace Planner needs. Built by the caller (WC) from a
/// freshly loaded row so that the CAS `expected_operation` is always the
/// value Planner actually saw.
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub phase: Phase,
    pub operation: Operation,
    pub desired_state: DesiredState,
    pub conditions: Conditions,
    pub archive_key: Option<String>,
    pub op_started_at: Option<DateTime<Utc>>,
    pub archive_op_id: Option<OpId>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanAction {
    pub operation: Operation,
    pub phase: Phase,
    pub error_reason: Option<ErrorReason>,
    pub archive_key: Option<String>,
    pub archive_op_id: Option<OpId>,
    pub complete: bool,
}

impl PlanAction {
    fn no_op(phase: Phase) -> Self {
        Self {
            operation: Operation::None,
            phase,
            error_reason: None,
            archive_key: None,
            archive_op_id: None,
            complete: false,
        }
    }
}

fn to_judge_input(p: &PlanInput) -> JudgeInput {
    JudgeInput {
        container_ready: p.conditions.container_ready(),
        volume_ready: p.conditions.volume_ready(),
        archive_ready: p.conditions.archive_ready(),
        archive_reason: p.conditions.archive_failure_reason(),
        deleted: p.deleted,
    }
}

/// Per-operation completion predicate (spec §4.F step 1).
fn operation_complete(op: Operation, p: &PlanInput) -> bool {
    let c = &p.conditions;
    match op {
        Operation::None => true,
        Operation::Provisioning => c.volume_ready(),
        Operation::Starting => c.container_ready(),
        Operation::Stopping => !c.container_ready(),
        Operation::Archiving | Operation::CreateEmptyArchive => {
            if c.volume_ready() || !c.archive_ready() {
                return false;
            }
            match (&p.archive_op_id, c.archive_key()) {
                (Some(op_id), Some(key)) => key.contains(&op_id.to_string()),
                _ => false,
            }
        }
        Operation::Restoring => {
            let marker_matches = match (&p.archive_key, c.restore.as_ref().and_then(|r| r.archive_key.as_deref())) {
                (Some(want), Some(got)) => want == got,
                _ => false,
            };
            marker_matches && c.volume_ready()
        }
        Operation::Deleting => !c.container_ready() && !c.volume_ready(),
    }
}

fn phase_from_desired(desired: DesiredState) -> Phase {
    desired.converged_phase()
}

/// `(judge.phase, desired_state) -> next operation`, spec §4.F step 4.
fn select_operation(phase: Phase, desired: DesiredState) -> Operation {
    if desired == DesiredState::Deleted {
        return Operation::Deleting;
    }
    match (phase, desired) {
        (Phase::Pending, DesiredState::Running | DesiredState::Standby) => Operation::Provisioning,
        (Phase::Pending, DesiredState::Archived) => Operation::CreateEmptyArchive,
        (Phase::Archived, DesiredState::Running | DesiredState::Standby) => Operation::Restoring,
        (Phase::Standby, DesiredState::Running) => Operation::Starting,
        (Phase::Standby, DesiredState::Archived) => Operation::Archiving,
        (Phase::Running, DesiredState::Standby | DesiredState::Archived) => Operation::Stopping,
        _ => Operation::None,
    }
}

/// `(workspace view, judge output, operation timeout) -> PlanAction`.
pub fn plan(input: &PlanInput, timeout: chrono::Duration, now: DateTime<Utc>) -> PlanAction {
    let judge_input = to_judge_input(input);
    let judge_output: JudgeOutput = judge(judge_input, input.archive_key.as_deref());

    // Case 1: an operation is already in progress.
    if input.operation != Operation::None {
        if operation_complete(input.operation, input) {
            return PlanAction {
                operation: Operation::None,
                phase: judge_output.phase,
                error_reason: None,
                archive_key: input.archive_key.clone(),
                archive_op_id: None,
                complete: true,
            };
        }
        let timed_out = match input.op_started_at {
            Some(started) => crate::judge::operation_timed_out(started, timeout, now),
            None => false,
        };
        if timed_out {
            return PlanAction {
                operation: Operation::None,
                phase: Phase::Error,
                error_reason: Some(ErrorReason::Timeout),
                archive_key: None,
                archive_op_id: None,
                complete: false,
            };
        }
        // Reissue the same operation, preserving archive_op_id for
        // idempotent S3 paths.
        return PlanAction {
            operation: input.operation,
            phase: judge_output.phase,
            error_reason: None,
            archive_key: None,
            archive_op_id: input.archive_op_id,
            complete: false,
        };
    }

    // Case 2: Judge says ERROR.
    if judge_output.phase == Phase::Error {
        if input.desired_state == DesiredState::Deleted {
            return PlanAction {
                operation: Operation::Deleting,
                phase: Phase::Deleting,
                error_reason: None,
                archive_key: None,
                archive_op_id: None,
                complete: false,
            };
        }
        return PlanAction {
            operation: Operation::None,
            phase: Phase::Error,
            error_reason: judge_output.error_reason,
            archive_key: None,
            archive_op_id: None,
            complete: false,
        };
    }

    // Case 3: already converged.
    let target_phase = phase_from_desired(input.desired_state);
    if judge_output.phase == target_phase {
        return PlanAction::no_op(judge_output.phase);
    }

    // Case 4: select next operation.
    let operation = select_operation(judge_output.phase, input.desired_state);
    if operation == Operation::None {
        return PlanAction::no_op(judge_output.phase);
    }

    let archive_op_id = matches!(operation, Operation::Archiving | Operation::CreateEmptyArchive)
        .then(OpId::new);

    PlanAction {
        operation,
        phase: judge_output.phase,
        error_reason: None,
        archive_key: None,
        archive_op_id,
        complete: false,
    }
}

/// Whether WC must actually invoke the Runtime for this action: a brand-new
/// operation, or a retry of the one already in flight. A freshly completed
/// or no-op action never needs execution.
pub fn needs_execute(action: &PlanAction, current_operation: Operation) -> bool {
    if action.operation == Operation::None || action.complete {
        return false;
    }
    current_operation == Operation::None || current_operation == action.operation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArchiveCondition, ContainerCondition, VolumeCondition};

    fn base_input() -> PlanInput {
        PlanInput {
            phase: Phase::Pending,
            operation: Operation::None,
            desired_state: DesiredState::Running,
            conditions: Conditions::default(),
            archive_key: None,
            op_started_at: None,
            archive_op_id: None,
            deleted: false,
        }
    }

    #[test]
    fn pending_to_running_selects_provisioning() {
        let input = base_input();
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::Provisioning);
        assert!(action.archive_op_id.is_none());
    }

    #[test]
    fn pending_to_archived_selects_create_empty_archive_with_op_id() {
        let mut input = base_input();
        input.desired_state = DesiredState::Archived;
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::CreateEmptyArchive);
        assert!(action.archive_op_id.is_some());
    }

    #[test]
    fn already_converged_is_no_op() {
        let mut input = base_input();
        input.conditions.container = Some(ContainerCondition { running: true, healthy: true });
        input.conditions.volume = Some(VolumeCondition { exists: true });
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::None);
        assert_eq!(action.phase, Phase::Running);
    }

    #[test]
    fn in_progress_operation_preserves_archive_op_id_on_retry() {
        let op_id = OpId::new();
        let mut input = base_input();
        input.operation = Operation::Archiving;
        input.archive_op_id = Some(op_id);
        input.op_started_at = Some(Utc::now());
        // Not yet complete: volume still present.
        input.conditions.volume = Some(VolumeCondition { exists: true });
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::Archiving);
        assert_eq!(action.archive_op_id, Some(op_id));
        assert!(!action.complete);
    }

    #[test]
    fn in_progress_operation_times_out_to_error() {
        let mut input = base_input();
        input.operation = Operation::Starting;
        input.op_started_at = Some(Utc::now() - chrono::Duration::seconds(301));
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::None);
        assert_eq!(action.phase, Phase::Error);
        assert_eq!(action.error_reason, Some(ErrorReason::Timeout));
    }

    #[test]
    fn archiving_completes_when_key_matches_op_id_and_volume_gone() {
        let op_id = OpId::new();
        let mut input = base_input();
        input.operation = Operation::Archiving;
        input.archive_op_id = Some(op_id);
        input.op_started_at = Some(Utc::now());
        input.conditions.archive = Some(ArchiveCondition {
            exists: true,
            archive_key: Some(format!("codehub-ws-w1/{op_id}/home.tar.zst")),
            failure_reason: None,
        });
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert!(action.complete);
        assert_eq!(action.operation, Operation::None);
    }

    #[test]
    fn error_with_desired_deleted_emits_deleting() {
        let mut input = base_input();
        input.conditions.container = Some(ContainerCondition { running: true, healthy: true });
        // container without volume => ERROR
        input.desired_state = DesiredState::Deleted;
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::Deleting);
        assert_eq!(action.phase, Phase::Deleting);
    }

    #[test]
    fn error_without_delete_intent_stays_in_error() {
        let mut input = base_input();
        input.conditions.container = Some(ContainerCondition { running: true, healthy: true });
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::None);
        assert_eq!(action.phase, Phase::Error);
    }

    #[test]
    fn running_to_archived_requires_stopping_first() {
        let mut input = base_input();
        input.conditions.container = Some(ContainerCondition { running: true, healthy: true });
        input.conditions.volume = Some(VolumeCondition { exists: true });
        input.desired_state = DesiredState::Archived;
        let action = plan(&input, chrono::Duration::seconds(300), Utc::now());
        assert_eq!(action.operation, Operation::Stopping);
    }

    #[test]
    fn needs_execute_is_false_for_no_op_and_completed_actions() {
        let no_op = PlanAction::no_op(Phase::Running);
        assert!(!needs_execute(&no_op, Operation::None));

        let completed = PlanAction {
            operation: Operation::None,
            phase: Phase::Running,
            error_reason: None,
            archive_key: None,
            archive_op_id: None,
            complete: true,
        };
        assert!(!needs_execute(&completed, Operation::Starting));
    }

    #[test]
    fn needs_execute_is_true_for_fresh_or_retried_operation() {
        let action = PlanAction {
            operation: Operation::Starting,
            phase: Phase::Standby,
            error_reason: None,
            archive_key: None,
            archive_op_id: None,
            complete: false,
        };
        assert!(needs_execute(&action, Operation::None));
        assert!(needs_execute(&action, Operation::Starting));
        assert!(!needs_execute(&action, Operation::Stopping));
    }
}
