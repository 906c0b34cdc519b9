//! Workspace CRUD and lifecycle-intent endpoints (spec §4.L). This layer
//! only ever writes `desired_state`/metadata/`deleted_at`; everything else
//! about how a workspace gets there is the coordinators' job (spec §9, "on
//! the API boundary's restraint").

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use codehub_core::database::WorkspaceRepo;
use codehub_core::domain::{DesiredState, Workspace};
use codehub_core::ids::WorkspaceId;

use crate::auth::{authorize_workspace, AuthUser};
use crate::errors::AppError;
use crate::state::AppState;
use crate::workspace_service::{self, StartError};

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub image_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWorkspaceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub memo: Option<String>,
}

fn parse_workspace_id(raw: &str) -> Result<WorkspaceId, AppError> {
    WorkspaceId::from_str(raw).map_err(|_| AppError::invalid_request("malformed workspace id"))
}

async fn enforce_running_cap(state: &AppState, user_id: codehub_core::ids::UserId) -> Result<(), AppError> {
    let running = workspace_service::count_running(state, user_id, None).await?;
    let cap = state.config.workspace_defaults.max_running_per_user as usize;
    if running >= cap {
        return Err(AppError::too_many_requests(
            format!("already running {running} of {cap} permitted workspaces"),
            0,
        ));
    }
    Ok(())
}

/// `POST /api/v1/workspaces`.
pub async fn create(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<CreateWorkspaceRequest>,
) -> Result<Json<Workspace>, AppError> {
    if body.name.trim().is_empty() || body.image_ref.trim().is_empty() {
        return Err(AppError::invalid_request("name and image_ref are required"));
    }
    enforce_running_cap(&state, user_id).await?;

    let workspace = WorkspaceRepo::create(
        &state.db,
        WorkspaceId::new(),
        user_id,
        &body.name,
        &body.description,
        &body.image_ref,
        state.config.workspace_defaults.standby_ttl_seconds,
        state.config.workspace_defaults.archive_ttl_seconds,
    )
    .await?;

    Ok(Json(workspace))
}

/// `GET /api/v1/workspaces`.
pub async fn list(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<Workspace>>, AppError> {
    let workspaces = WorkspaceRepo::list_for_user(&state.db, user_id).await?;
    Ok(Json(workspaces))
}

/// `GET /api/v1/workspaces/{id}`.
pub async fn get(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Workspace>, AppError> {
    let id = parse_workspace_id(&id)?;
    authorize_workspace(&state, id, user_id).await?;
    let workspace = WorkspaceRepo::find(&state.db, id).await?.ok_or_else(AppError::workspace_not_found)?;
    Ok(Json(workspace))
}

/// `PATCH /api/v1/workspaces/{id}`.
pub async fn update(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateWorkspaceRequest>,
) -> Result<Json<Workspace>, AppError> {
    let id = parse_workspace_id(&id)?;
    authorize_workspace(&state, id, user_id).await?;
    let workspace = WorkspaceRepo::update_metadata(
        &state.db,
        id,
        body.name.as_deref(),
        body.description.as_deref(),
        body.memo.as_deref(),
    )
    .await?
    .ok_or_else(AppError::workspace_not_found)?;
    Ok(Json(workspace))
}

/// `DELETE /api/v1/workspaces/{id}`. A concurrent duplicate delete loses the
/// `deleted_at IS NULL` race in the database and gets 404 (spec §8 scenario
/// 6), never a second 204.
pub async fn delete(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode, AppError> {
    let id = parse_workspace_id(&id)?;
    authorize_workspace(&state, id, user_id).await?;
    let deleted = WorkspaceRepo::soft_delete(&state.db, id, Utc::now()).await?;
    if deleted {
        state.ownership_cache.invalidate(&(id, user_id));
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(AppError::workspace_not_found())
    }
}

/// `POST /api/v1/workspaces/{id}:start` / `:stop`. axum's router can't match
/// a param and a literal suffix inside one path segment, so both verbs are
/// registered on one route and dispatched here by splitting the colon the
/// wire format actually uses, rather than splitting them into two separate
/// `/start` and `/stop` path segments the spec's external interface doesn't have.
pub async fn start_or_stop(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id_and_verb): Path<String>,
) -> Result<axum::http::StatusCode, AppError> {
    let (raw_id, verb) = id_and_verb
        .split_once(':')
        .ok_or_else(|| AppError::invalid_request("expected {id}:start or {id}:stop"))?;
    let id = parse_workspace_id(raw_id)?;
    authorize_workspace(&state, id, user_id).await?;
    match verb {
        "start" => match workspace_service::request_start(&state, id, user_id).await {
            Ok(()) => Ok(axum::http::StatusCode::NO_CONTENT),
            Err(StartError::LimitExceeded(limit)) => Err(AppError::too_many_requests(
                format!("already running {} of {} permitted workspaces", limit.running.len(), limit.max),
                0,
            )),
            Err(StartError::Internal(err)) => Err(err),
        },
        "stop" => set_desired_state(&state, id, DesiredState::Standby).await,
        _ => Err(AppError::invalid_request("unknown workspace verb")),
    }
}

async fn set_desired_state(
    state: &AppState,
    id: WorkspaceId,
    desired_state: DesiredState,
) -> Result<axum::http::StatusCode, AppError> {
    let mut conn = state.db.acquire().await?;
    let applied = WorkspaceRepo::cas_set_desired_state(&mut conn, id, desired_state).await?;
    if applied {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(AppError::workspace_not_found())
    }
}
