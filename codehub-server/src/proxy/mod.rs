//! The authenticated workspace proxy (spec §4.J): `/w/{id}/...` terminates
//! here rather than in the API router, since every request on this path
//! carries bytes to or from a container instead of mutating workspace state
//! directly.

pub mod pages;
pub mod policy;
pub mod transport;
pub mod websocket;

use std::str::FromStr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum_extra::extract::CookieJar;

use codehub_core::database::WorkspaceRepo;
use codehub_core::ids::WorkspaceId;

use crate::errors::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/w/{id}", any(trailing_slash_redirect))
        .route("/w/{id}/{*rest}", any(handle))
}

async fn trailing_slash_redirect(Path(id): Path<String>) -> Response {
    match WorkspaceId::from_str(&id) {
        Ok(id) => pages::trailing_slash_redirect(id),
        Err(_) => AppError::invalid_request("malformed workspace id").into_response(),
    }
}

/// Single entry point for both ordinary HTTP requests and WebSocket upgrades
/// on `/w/{id}/{*rest}`: axum routes both to the same handler since the
/// only distinguishing signal is the `Upgrade` request header, not the
/// path or method.
async fn handle(State(state): State<AppState>, Path((id, rest)): Path<(String, String)>, req: Request) -> Response {
    match handle_inner(state, id, rest, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_inner(
    state: AppState,
    id_raw: String,
    rest: String,
    req: Request,
) -> Result<Response, AppError> {
    let id = WorkspaceId::from_str(&id_raw).map_err(|_| AppError::invalid_request("malformed workspace id"))?;

    let is_websocket_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_websocket_upgrade {
        let outcome = resolve_ws_outcome(&state, req.headers(), id).await;
        let (mut parts, _body) = req.into_parts();
        let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
            .await
            .map_err(|_| AppError::invalid_request("invalid websocket upgrade"))?;
        let state = state.clone();
        return Ok(ws.on_upgrade(move |socket| websocket::handle(socket, state, outcome, rest)));
    }

    let user_id = authenticate(&state, req.headers()).await?;
    crate::auth::authorize_workspace(&state, id, user_id).await?;
    let workspace = WorkspaceRepo::find(&state.db, id).await?.ok_or_else(AppError::workspace_not_found)?;

    match policy::decide_http(&state, &workspace, user_id).await {
        policy::HttpDecision::Allow => {}
        policy::HttpDecision::Redirect(response) => return Ok(response),
    }

    state.activity.record(id);
    let upstream = state
        .runtime
        .get_upstream(id)
        .await?
        .ok_or_else(|| AppError::upstream_unavailable("workspace container is not reachable"))?;

    let query = req.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
    let path_and_query = format!("/{rest}{query}");
    transport::relay_http(&state.http, upstream, &path_and_query, req).await
}

async fn authenticate(state: &AppState, headers: &axum::http::HeaderMap) -> Result<codehub_core::ids::UserId, AppError> {
    let jar = CookieJar::from_headers(headers);
    let cookie = jar
        .get(&state.config.auth.session_cookie_name)
        .ok_or_else(|| AppError::unauthorized("missing session cookie"))?;
    crate::auth::resolve_session(state, cookie.value()).await
}

async fn resolve_ws_outcome(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    id: WorkspaceId,
) -> websocket::WsOutcome {
    let user_id = match authenticate(state, headers).await {
        Ok(user_id) => user_id,
        Err(_) => return websocket::WsOutcome::Close { code: 1008, reason: "Authentication required" },
    };
    if crate::auth::authorize_workspace(state, id, user_id).await.is_err() {
        return websocket::WsOutcome::Close { code: 1008, reason: "Access denied" };
    }
    let workspace = match WorkspaceRepo::find(&state.db, id).await {
        Ok(Some(workspace)) => workspace,
        _ => return websocket::WsOutcome::Close { code: 1008, reason: "Workspace not found" },
    };
    match policy::decide_ws(&workspace) {
        policy::WsDecision::Allow => websocket::WsOutcome::Allow { workspace_id: id },
        policy::WsDecision::Close { code, reason } => websocket::WsOutcome::Close { code, reason },
    }
}
