//! Session lifecycle endpoints (spec §4.L, §6, §8 scenarios 7-8).

use axum::extract::State;
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use codehub_core::database::SessionRepo;
use codehub_core::ids::SessionId;

use crate::auth::password::verify_password;
use crate::auth::AuthUser;
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
}

fn session_cookie(state: &AppState, value: String) -> Cookie<'static> {
    Cookie::build((state.config.auth.session_cookie_name.clone(), value))
        .http_only(true)
        .path("/")
        .same_site(SameSite::Lax)
        .build()
}

/// `POST /api/v1/auth/login`. Five consecutive failures for a username lock
/// it out for the configured window regardless of whether the sixth attempt
/// supplies the correct password (spec §8 scenario 7).
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> Result<(CookieJar, Json<UserResponse>), AppError> {
    if let Some(retry_after_secs) = state.login_lockout.check(&body.username) {
        return Err(AppError::too_many_requests("account temporarily locked", retry_after_secs));
    }

    let user = SessionRepo::find_user_by_username(&state.db, &body.username).await?;
    let user = match user {
        Some(user) if verify_password(&body.password, &user.password_hash) => user,
        _ => {
            state.login_lockout.record_failure(&body.username);
            return Err(AppError::unauthorized("invalid username or password"));
        }
    };
    state.login_lockout.record_success(&body.username);

    let session_id = SessionId::new();
    let session_ttl = chrono::Duration::from_std(state.config.auth.session_ttl)
        .map_err(|_| AppError::internal("session TTL out of range"))?;
    let expires_at = Utc::now() + session_ttl;
    SessionRepo::create_session(&state.db, session_id, user.id, expires_at).await?;

    let jar = jar.add(session_cookie(&state, session_id.to_string()));
    Ok((jar, Json(UserResponse { id: user.id.to_string(), username: user.username })))
}

/// `POST /api/v1/auth/logout`. Revokes the session named by the cookie and
/// drops it client-side; missing or already-invalid cookies are a no-op
/// rather than an error, since the end state the caller wants is the same.
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<CookieJar, AppError> {
    if let Some(cookie) = jar.get(&state.config.auth.session_cookie_name) {
        if let Ok(session_id) = SessionId::from_str(cookie.value()) {
            SessionRepo::revoke(&state.db, session_id).await?;
        }
        state.session_cache.invalidate(&cookie.value().to_string());
    }
    Ok(jar.remove(state.config.auth.session_cookie_name.clone()))
}

/// `GET /api/v1/auth/me`.
pub async fn me(State(state): State<AppState>, AuthUser(user_id): AuthUser) -> Result<Json<UserResponse>, AppError> {
    let user = SessionRepo::find_user_by_id(&state.db, user_id)
        .await?
        .ok_or_else(|| AppError::unauthorized("session no longer valid"))?;
    Ok(Json(UserResponse { id: user.id.to_string(), username: user.username }))
}
