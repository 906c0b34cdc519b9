//! Status-page redirect builders for non-`RUNNING` phases (spec §4.J policy
//! step 3). Every page is a static file under `/static/proxy/`; the
//! redirect's query string is the only place that carries workspace state.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use codehub_core::domain::{ErrorReason, Phase, Workspace};
use codehub_core::ids::WorkspaceId;
use urlencoding::encode;

fn redirect(url: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "PENDING",
        Phase::Standby => "STANDBY",
        Phase::Running => "RUNNING",
        Phase::Archived => "ARCHIVED",
        Phase::Deleting => "DELETING",
        Phase::Deleted => "DELETED",
        Phase::Error => "ERROR",
    }
}

fn error_reason_label(reason: ErrorReason) -> &'static str {
    match reason {
        ErrorReason::ContainerWithoutVolume => "CONTAINER_WITHOUT_VOLUME",
        ErrorReason::ArchiveCorrupted => "ARCHIVE_CORRUPTED",
        ErrorReason::ArchiveExpired => "ARCHIVE_EXPIRED",
        ErrorReason::ArchiveNotFound => "ARCHIVE_NOT_FOUND",
        ErrorReason::ArchiveUnreachable => "ARCHIVE_UNREACHABLE",
        ErrorReason::ArchiveTimeout => "ARCHIVE_TIMEOUT",
        ErrorReason::Timeout => "TIMEOUT",
        ErrorReason::ChecksumMismatch => "CHECKSUM_MISMATCH",
    }
}

/// `STANDBY` workspace, auto-wake just triggered.
pub fn starting_page(workspace: &Workspace) -> Response {
    redirect(format!(
        "/static/proxy/starting.html?id={}&name={}",
        workspace.id,
        encode(&workspace.name)
    ))
}

/// `ARCHIVED` workspace, auto-wake (restore) just triggered.
pub fn restoring_page(workspace: &Workspace) -> Response {
    redirect(format!(
        "/static/proxy/restoring.html?id={}&name={}",
        workspace.id,
        encode(&workspace.name)
    ))
}

/// Auto-wake was refused because the caller is already at
/// `max_running_per_user`.
pub fn limit_exceeded_page(running: &[Workspace], max: u32) -> Response {
    let workspaces = running
        .iter()
        .map(|w| format!("{}:{}", w.id, encode(&w.name)))
        .collect::<Vec<_>>()
        .join(",");
    redirect(format!("/static/proxy/limit.html?max={max}&workspaces={workspaces}"))
}

/// Any other phase (`PENDING`, `DELETING`, `DELETED`, `ERROR`).
pub fn error_page(workspace: &Workspace) -> Response {
    let mut url = format!(
        "/static/proxy/error.html?phase={}&name={}",
        phase_label(workspace.phase),
        encode(&workspace.name)
    );
    if let Some(reason) = workspace.error_reason {
        url.push_str("&error=");
        url.push_str(error_reason_label(reason));
    }
    redirect(url)
}

/// `GET /w/{id}` with no trailing slash: permanently redirect so relative
/// asset links the container serves resolve against `/w/{id}/`.
pub fn trailing_slash_redirect(id: WorkspaceId) -> Response {
    (StatusCode::PERMANENT_REDIRECT, [(header::LOCATION, format!("/w/{id}/"))]).into_response()
}
