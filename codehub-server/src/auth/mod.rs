//! Session authentication and per-workspace ownership checks (spec §4.J
//! step 1-2, §4.L). `AuthUser` is an axum extractor so every handler that
//! needs the caller's identity just takes it as an argument; the proxy path
//! uses the same lookup functions directly since it authenticates ahead of
//! routing rather than via extractor.

pub mod cache;
pub mod lockout;
pub mod password;

use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;
use chrono::Utc;

use codehub_core::database::SessionRepo;
use codehub_core::database::WorkspaceRepo;
use codehub_core::ids::{SessionId, UserId, WorkspaceId};

use crate::errors::AppError;
use crate::state::AppState;

/// The authenticated caller, extracted from the session cookie.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let cookie = jar
            .get(&state.config.auth.session_cookie_name)
            .ok_or_else(|| AppError::unauthorized("missing session cookie"))?;
        let user_id = resolve_session(state, cookie.value()).await?;
        Ok(AuthUser(user_id))
    }
}

/// Resolves a raw session cookie value to a user id, consulting the
/// short-TTL cache before Postgres (spec §4.J step 1).
pub async fn resolve_session(state: &AppState, cookie_value: &str) -> Result<UserId, AppError> {
    if let Some(user_id) = state.session_cache.get(&cookie_value.to_string()) {
        return Ok(user_id);
    }

    let session_id =
        SessionId::from_str(cookie_value).map_err(|_| AppError::unauthorized("invalid session cookie"))?;
    let session = SessionRepo::find(&state.db, session_id)
        .await?
        .ok_or_else(|| AppError::unauthorized("session not found"))?;
    if !session.is_valid_at(Utc::now()) {
        return Err(AppError::unauthorized("session expired or revoked"));
    }

    state.session_cache.insert(cookie_value.to_string(), session.user_id);
    Ok(session.user_id)
}

/// Confirms `user_id` owns `workspace_id` (spec §4.J step 2), consulting the
/// short-TTL ownership cache before Postgres. Returns 404 rather than 403
/// for a workspace that doesn't exist at all, and 403 for one owned by
/// someone else, matching spec §8 scenario 5.
pub async fn authorize_workspace(
    state: &AppState,
    workspace_id: WorkspaceId,
    user_id: UserId,
) -> Result<(), AppError> {
    if let Some(owned) = state.ownership_cache.get(&(workspace_id, user_id)) {
        return if owned { Ok(()) } else { Err(AppError::forbidden("not the workspace owner")) };
    }

    let workspace =
        WorkspaceRepo::find(&state.db, workspace_id).await?.ok_or_else(AppError::workspace_not_found)?;
    let owned = workspace.owner_user_id == user_id && !workspace.is_deleted();
    state.ownership_cache.insert((workspace_id, user_id), owned);
    if owned {
        Ok(())
    } else {
        Err(AppError::forbidden("not the workspace owner"))
    }
}
