use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{OpId, UserId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pending,
    Standby,
    Running,
    Archived,
    Deleting,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    None,
    Provisioning,
    Starting,
    Stopping,
    Archiving,
    Restoring,
    CreateEmptyArchive,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    Running,
    Standby,
    Archived,
    Deleted,
}

impl DesiredState {
    /// The phase a fully converged workspace would sit in for this desired state.
    pub fn converged_phase(self) -> Phase {
        match self {
            DesiredState::Running => Phase::Running,
            DesiredState::Standby => Phase::Standby,
            DesiredState::Archived => Phase::Archived,
            DesiredState::Deleted => Phase::Deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    ContainerWithoutVolume,
    ArchiveCorrupted,
    ArchiveExpired,
    ArchiveNotFound,
    ArchiveUnreachable,
    ArchiveTimeout,
    Timeout,
    ChecksumMismatch,
}

/// The container-resource observation. `None` means the Runtime reported no
/// information about the container -- absence, not an unknown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerCondition {
    pub running: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeCondition {
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchiveCondition {
    pub exists: bool,
    pub archive_key: Option<String>,
    /// Set by Observer when the Runtime reported a specific archive failure
    /// rather than plain absence (e.g. a checksum mismatch or an S3 timeout).
    pub failure_reason: Option<ArchiveFailureReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFailureReason {
    Corrupted,
    Expired,
    NotFound,
    Unreachable,
    Timeout,
}

impl ArchiveFailureReason {
    /// Terminal failures can never resolve themselves; transient ones may
    /// clear on a later Observer tick.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ArchiveFailureReason::Corrupted
                | ArchiveFailureReason::Expired
                | ArchiveFailureReason::NotFound
        )
    }

    pub fn into_error_reason(self) -> ErrorReason {
        match self {
            ArchiveFailureReason::Corrupted => ErrorReason::ArchiveCorrupted,
            ArchiveFailureReason::Expired => ErrorReason::ArchiveExpired,
            ArchiveFailureReason::NotFound => ErrorReason::ArchiveNotFound,
            ArchiveFailureReason::Unreachable => ErrorReason::ArchiveUnreachable,
            ArchiveFailureReason::Timeout => ErrorReason::ArchiveTimeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestoreCondition {
    pub archive_key: Option<String>,
}

/// Observer-owned resource observation vector. Every leaf is `Option` because
/// `null` is itself meaningful: the resource is not present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    pub container: Option<ContainerCondition>,
    pub volume: Option<VolumeCondition>,
    pub archive: Option<ArchiveCondition>,
    pub restore: Option<RestoreCondition>,
}

impl Conditions {
    pub fn container_ready(&self) -> bool {
        self.container.map(|c| c.running && c.healthy).unwrap_or(false)
    }

    pub fn volume_ready(&self) -> bool {
        self.volume.map(|v| v.exists).unwrap_or(false)
    }

    pub fn archive_ready(&self) -> bool {
        self.archive.as_ref().map(|a| a.exists).unwrap_or(false)
    }

    pub fn archive_key(&self) -> Option<&str> {
        self.archive.as_ref().and_then(|a| a.archive_key.as_deref())
    }

    pub fn archive_failure_reason(&self) -> Option<ArchiveFailureReason> {
        self.archive.as_ref().and_then(|a| a.failure_reason)
    }
}

/// The central reconciled entity. Field groups are annotated with their
/// single writer per the column-ownership discipline (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub owner_user_id: UserId,

    // Proxy/API-owned metadata.
    pub name: String,
    pub description: String,
    pub memo: String,
    pub image_ref: String,
    pub home_store_key: String,

    // Observer-owned.
    pub conditions: Conditions,
    pub observed_at: Option<DateTime<Utc>>,

    // WC-owned.
    pub phase: Phase,
    pub operation: Operation,
    pub op_started_at: Option<DateTime<Utc>>,
    pub op_id: Option<OpId>,
    pub archive_op_id: Option<OpId>,
    pub archive_key: Option<String>,
    pub error_reason: Option<ErrorReason>,
    pub error_count: i32,
    pub phase_changed_at: Option<DateTime<Utc>>,

    // Scheduler-owned.
    pub desired_state: DesiredState,

    // Proxy/API-owned.
    pub last_access_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,

    pub standby_ttl_seconds: i64,
    pub archive_ttl_seconds: i64,
}

impl Workspace {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
