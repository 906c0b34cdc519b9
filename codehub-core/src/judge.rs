//! Pure phase computation. Judge never reads the clock, an id, or any
//! external state -- it is a total function over three booleans, an
//! optional archive-failure reason, an optional stored archive key, and
//! whether the workspace is soft-deleted. See spec §4.E.

use chrono::{DateTime, Utc};

use crate::domain::{ArchiveFailureReason, ErrorReason, Phase};

#[derive(Debug, Clone, Copy, Default)]
pub struct JudgeInput {
    pub container_ready: bool,
    pub volume_ready: bool,
    pub archive_ready: bool,
    pub archive_reason: Option<ArchiveFailureReason>,
    pub deleted: bool,
}

impl JudgeInput {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JudgeOutput {
    pub phase: Phase,
    pub healthy: bool,
    pub error_reason: Option<ErrorReason>,
}

/// `(conditions, deleted?) -> (phase, healthy, error_reason)`. Evaluation
/// order is fixed and load-bearing: invariant violations outrank deletion,
/// which outranks the resource pyramid, which outranks the archive-key
/// fallback.
pub fn judge(input: JudgeInput, stored_archive_key: Option<&str>) -> JudgeOutput {
    // 1. Invariant violation takes absolute priority.
    if input.container_ready && !input.volume_ready {
        return JudgeOutput {
            phase: Phase::Error,
            healthy: false,
            error_reason: Some(ErrorReason::ContainerWithoutVolume),
        };
    }

    // 2. Terminal archive failures are errors regardless of anything else.
    if let Some(reason) = input.archive_reason {
        if reason.is_terminal() {
            return JudgeOutput {
                phase: Phase::Error,
                healthy: false,
                error_reason: Some(reason.into_error_reason()),
            };
        }
    }

    // 3. Soft-deletion.
    if input.deleted {
        let still_present = input.container_ready || input.volume_ready || input.archive_ready;
        return JudgeOutput {
            phase: if still_present { Phase::Deleting } else { Phase::Deleted },
            healthy: true,
            error_reason: None,
        };
    }

    // 4. Resource pyramid, descending specificity.
    if input.container_ready && input.volume_ready {
        return JudgeOutput { phase: Phase::Running, healthy: true, error_reason: None };
    }
    if input.volume_ready {
        return JudgeOutput { phase: Phase::Standby, healthy: true, error_reason: None };
    }
    if input.archive_ready {
        return JudgeOutput { phase: Phase::Archived, healthy: true, error_reason: None };
    }

    // 5. Fallback: a previously committed archive key still exists even
    // though the Runtime currently can't confirm the archive.
    if let Some(reason) = input.archive_reason {
        if stored_archive_key.is_some() {
            return if reason.is_terminal() {
                JudgeOutput {
                    phase: Phase::Error,
                    healthy: false,
                    error_reason: Some(reason.into_error_reason()),
                }
            } else {
                JudgeOutput { phase: Phase::Archived, healthy: true, error_reason: None }
            };
        }
    }

    // 6. Nothing observed anywhere: a fresh, not-yet-provisioned workspace.
    JudgeOutput { phase: Phase::Pending, healthy: true, error_reason: None }
}

/// Whether `op_started_at + timeout` has elapsed as of `now`. Planner's only
/// use of wall-clock time, gated behind an explicit parameter per spec §9.
pub fn operation_timed_out(
    op_started_at: DateTime<Utc>,
    timeout: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    op_started_at + timeout < now
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(container: bool, volume: bool, archive: bool) -> JudgeInput {
        JudgeInput {
            container_ready: container,
            volume_ready: volume,
            archive_ready: archive,
            ..JudgeInput::new()
        }
    }

    #[test]
    fn all_false_yields_pending() {
        let out = judge(input(false, false, false), None);
        assert_eq!(out.phase, Phase::Pending);
        assert!(out.healthy);
    }

    #[test]
    fn archive_only_yields_archived() {
        let out = judge(input(false, false, true), None);
        assert_eq!(out.phase, Phase::Archived);
    }

    #[test]
    fn volume_only_yields_standby() {
        let out = judge(input(false, true, false), None);
        assert_eq!(out.phase, Phase::Standby);
    }

    #[test]
    fn container_and_volume_yields_running() {
        let out = judge(input(true, true, false), None);
        assert_eq!(out.phase, Phase::Running);
    }

    #[test]
    fn container_without_volume_is_invariant_violation() {
        let out = judge(input(true, false, false), None);
        assert_eq!(out.phase, Phase::Error);
        assert!(!out.healthy);
        assert_eq!(out.error_reason, Some(ErrorReason::ContainerWithoutVolume));
    }

    #[test]
    fn archive_corrupted_is_error() {
        let mut i = input(false, false, false);
        i.archive_reason = Some(ArchiveFailureReason::Corrupted);
        let out = judge(i, None);
        assert_eq!(out.phase, Phase::Error);
        assert_eq!(out.error_reason, Some(ErrorReason::ArchiveCorrupted));
    }

    #[test]
    fn deleted_with_resources_is_deleting() {
        let mut i = input(true, true, false);
        i.deleted = true;
        let out = judge(i, None);
        assert_eq!(out.phase, Phase::Deleting);
    }

    #[test]
    fn deleted_without_resources_is_deleted() {
        let mut i = input(false, false, false);
        i.deleted = true;
        let out = judge(i, None);
        assert_eq!(out.phase, Phase::Deleted);
    }

    #[test]
    fn transient_archive_failure_with_stored_key_falls_back_to_archived() {
        let mut i = input(false, false, false);
        i.archive_reason = Some(ArchiveFailureReason::Unreachable);
        let out = judge(i, Some("ws-123/op-456/home.tar.zst"));
        assert_eq!(out.phase, Phase::Archived);
        assert!(out.healthy);
    }

    #[test]
    fn terminal_archive_failure_with_stored_key_is_error() {
        let mut i = input(false, false, false);
        i.archive_reason = Some(ArchiveFailureReason::NotFound);
        let out = judge(i, Some("ws-123/op-456/home.tar.zst"));
        assert_eq!(out.phase, Phase::Error);
    }

    #[test]
    fn transient_archive_failure_without_stored_key_is_pending() {
        let mut i = input(false, false, false);
        i.archive_reason = Some(ArchiveFailureReason::Unreachable);
        let out = judge(i, None);
        assert_eq!(out.phase, Phase::Pending);
    }

    #[test]
    fn timeout_reason_with_stored_key_falls_back_to_archived() {
        let mut i = input(false, false, false);
        i.archive_reason = Some(ArchiveFailureReason::Timeout);
        let out = judge(i, Some("ws-123/op-456/home.tar.zst"));
        assert_eq!(out.phase, Phase::Archived);
    }

    #[test]
    fn deleted_at_outranks_fully_healthy_resources() {
        let mut i = input(true, true, true);
        i.deleted = true;
        let out = judge(i, None);
        assert_eq!(out.phase, Phase::Deleting);
    }

    #[test]
    fn invariant_violation_outranks_resource_pyramid() {
        let out = judge(input(true, false, true), None);
        assert_eq!(out.phase, Phase::Error);
    }

    #[test]
    fn more_specific_resource_outranks_less_specific() {
        let out = judge(input(false, true, true), None);
        assert_eq!(out.phase, Phase::Standby);
    }

    #[test]
    fn judge_is_pure_for_fixed_input() {
        let i = input(true, true, false);
        assert_eq!(judge(i, None), judge(i, None));
    }
}
