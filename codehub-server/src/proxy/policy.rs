//! Phase-gated proxy policy (spec §4.J step 3). Kept as its own module so
//! the HTTP and WebSocket call sites can't drift on what each phase means --
//! one place decides, both paths ask it.

use axum::response::Response;
use codehub_core::domain::{Phase, Workspace};
use codehub_core::ids::UserId;

use crate::state::AppState;
use crate::workspace_service::{self, StartError};

use super::pages;

pub enum HttpDecision {
    Allow,
    Redirect(Response),
}

/// `decide_http`: `RUNNING` proxies through; `STANDBY`/`ARCHIVED` auto-wake
/// and redirect to a status page; anything else redirects to the error page.
pub async fn decide_http(state: &AppState, workspace: &Workspace, user_id: UserId) -> HttpDecision {
    match workspace.phase {
        Phase::Running => HttpDecision::Allow,
        Phase::Standby | Phase::Archived => {
            match workspace_service::request_start(state, workspace.id, user_id).await {
                Ok(()) => {
                    let page = if workspace.phase == Phase::Standby {
                        pages::starting_page(workspace)
                    } else {
                        pages::restoring_page(workspace)
                    };
                    HttpDecision::Redirect(page)
                }
                Err(StartError::LimitExceeded(limit)) => {
                    HttpDecision::Redirect(pages::limit_exceeded_page(&limit.running, limit.max))
                }
                Err(StartError::Internal(_)) => HttpDecision::Redirect(pages::error_page(workspace)),
            }
        }
        Phase::Pending | Phase::Deleting | Phase::Deleted | Phase::Error => {
            HttpDecision::Redirect(pages::error_page(workspace))
        }
    }
}

pub enum WsDecision {
    Allow,
    Close { code: u16, reason: &'static str },
}

/// `decide_ws`: only `RUNNING` is allowed through. WebSockets can't render an
/// HTML status page, so there is no auto-wake on this path (spec §4.J).
pub fn decide_ws(workspace: &Workspace) -> WsDecision {
    if workspace.phase == Phase::Running {
        WsDecision::Allow
    } else {
        WsDecision::Close { code: 1008, reason: "Workspace not running" }
    }
}
