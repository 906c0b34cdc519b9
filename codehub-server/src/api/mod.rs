//! The thin Axum API boundary (spec §4.L): the only writer of user-intent
//! columns other than the Scheduler's TTL demotion. Merged into the main
//! router alongside the proxy and SSE routes in `main.rs`.

pub mod auth;
pub mod workspaces;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/auth/logout", post(auth::logout))
        .route("/api/v1/auth/me", get(auth::me))
        .route("/api/v1/workspaces", post(workspaces::create).get(workspaces::list))
        .route(
            "/api/v1/workspaces/{id}",
            get(workspaces::get)
                .patch(workspaces::update)
                .delete(workspaces::delete)
                .post(workspaces::start_or_stop),
        )
}
