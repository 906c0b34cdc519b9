//! Shared workspace-lifecycle-intent logic (spec §4.J/§4.L): the one place
//! that knows how to move `desired_state` toward `RUNNING` under the per-user
//! concurrent-running cap. Both the API's `:start` endpoint and the proxy's
//! auto-wake path call through here so the cap can't drift between the two
//! callers.

use codehub_core::database::WorkspaceRepo;
use codehub_core::domain::{DesiredState, Workspace};
use codehub_core::ids::{UserId, WorkspaceId};

use crate::errors::AppError;
use crate::state::AppState;

/// Current count of the user's non-deleted workspaces with `desired_state =
/// RUNNING`, excluding `excluding` (used when re-evaluating a workspace that
/// is itself about to transition, so it doesn't count against its own cap
/// check).
pub async fn count_running(
    state: &AppState,
    user_id: UserId,
    excluding: Option<WorkspaceId>,
) -> Result<usize, AppError> {
    let workspaces = WorkspaceRepo::list_for_user(&state.db, user_id).await?;
    Ok(workspaces
        .iter()
        .filter(|w| Some(w.id) != excluding && w.desired_state == DesiredState::Running)
        .count())
}

pub async fn list_running(state: &AppState, user_id: UserId) -> Result<Vec<Workspace>, AppError> {
    let workspaces = WorkspaceRepo::list_for_user(&state.db, user_id).await?;
    Ok(workspaces.into_iter().filter(|w| w.desired_state == DesiredState::Running).collect())
}

/// Returned when starting a workspace would push the caller over
/// `max_running_per_user`. Carries the workspaces currently running so the
/// caller can build a limit-exceeded response without a second query.
pub struct RunningLimitExceeded {
    pub running: Vec<Workspace>,
    pub max: u32,
}

pub enum StartError {
    LimitExceeded(RunningLimitExceeded),
    Internal(AppError),
}

impl From<AppError> for StartError {
    fn from(err: AppError) -> Self {
        StartError::Internal(err)
    }
}

/// Sets `desired_state = RUNNING` for `id`, enforcing the per-user cap first.
/// Used by both `POST /api/v1/workspaces/{id}:start` and the proxy's
/// auto-wake (spec §4.J policy step 3).
pub async fn request_start(state: &AppState, id: WorkspaceId, user_id: UserId) -> Result<(), StartError> {
    let workspaces = WorkspaceRepo::list_for_user(&state.db, user_id).await?;
    let running: Vec<Workspace> = workspaces
        .into_iter()
        .filter(|w| w.id != id && w.desired_state == DesiredState::Running)
        .collect();
    let max = state.config.workspace_defaults.max_running_per_user;
    if running.len() as u32 >= max {
        return Err(StartError::LimitExceeded(RunningLimitExceeded { running, max }));
    }

    let mut conn = state.db.acquire().await?;
    let applied = WorkspaceRepo::cas_set_desired_state(&mut conn, id, DesiredState::Running).await?;
    if applied {
        Ok(())
    } else {
        Err(StartError::Internal(AppError::workspace_not_found()))
    }
}
