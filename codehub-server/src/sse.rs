//! `GET /events` (spec §4.B, §4.L): each connection reads its own
//! `events:{uid}` Redis stream through an ephemeral, connection-scoped
//! consumer group so it can use the `>` cursor the spec calls for without
//! competing with any other reader of that stream. Consecutive identical
//! `(phase, operation, error_reason, name, description, memo)` summaries are
//! collapsed to one event; a heartbeat keeps the connection alive every 30s.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use codehub_core::database::WorkspaceRepo;
use codehub_core::domain::{ErrorReason, Operation, Phase};
use codehub_core::ids::WorkspaceId;

use crate::auth::AuthUser;
use crate::errors::AppError;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const READ_BLOCK: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SsePayload {
    id: WorkspaceId,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct WorkspaceSummary {
    id: String,
    phase: Phase,
    operation: Operation,
    error_reason: Option<ErrorReason>,
    name: String,
    description: String,
    memo: String,
}

/// `GET /events`.
pub async fn stream(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let stream_key = format!("events:{user_id}");
    let group = format!("sse-{}", uuid::Uuid::now_v7());
    let consumer = "conn";

    let mut redis = state.redis.clone();
    let created: redis::RedisResult<()> = redis.xgroup_create_mkstream(&stream_key, &group, "$").await;
    if let Err(err) = created {
        if !err.to_string().contains("BUSYGROUP") {
            return Err(AppError::from(err));
        }
    }

    let (tx, rx) = mpsc::channel::<Event>(16);
    let db = state.db.clone();

    tokio::spawn(async move {
        if tx.send(Event::default().event("connected").data("{}")).await.is_err() {
            return;
        }

        let mut last_summary: Option<WorkspaceSummary> = None;
        let mut last_heartbeat = tokio::time::Instant::now();

        'outer: loop {
            if tx.is_closed() {
                break;
            }
            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                if tx.send(Event::default().event("heartbeat").data("{}")).await.is_err() {
                    break;
                }
                last_heartbeat = tokio::time::Instant::now();
            }

            let opts = redis::streams::StreamReadOptions::default()
                .group(group.as_str(), consumer)
                .count(10)
                .block(READ_BLOCK.as_millis() as usize);
            let reply: redis::streams::StreamReadReply =
                match redis.xread_options(&[stream_key.as_str()], &[">"], &opts).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(error = %err, "sse stream read failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

            for entry_stream in reply.keys {
                for entry in entry_stream.ids {
                    let _: Result<(), _> = redis.xack(stream_key.as_str(), group.as_str(), &[entry.id.clone()]).await;

                    let Some(raw) = entry.map.get("data").and_then(|v| redis::from_redis_value::<String>(v).ok())
                    else {
                        continue;
                    };
                    let Ok(payload) = serde_json::from_str::<SsePayload>(&raw) else { continue };

                    if payload.deleted {
                        let body = json!({"id": payload.id.to_string()}).to_string();
                        if tx.send(Event::default().event("workspace_deleted").data(body)).await.is_err() {
                            break 'outer;
                        }
                        continue;
                    }

                    let workspace = match WorkspaceRepo::find(&db, payload.id).await {
                        Ok(Some(workspace)) if workspace.owner_user_id == user_id => workspace,
                        _ => continue,
                    };

                    if workspace.is_deleted() {
                        let body = json!({"id": workspace.id.to_string()}).to_string();
                        if tx.send(Event::default().event("workspace_deleted").data(body)).await.is_err() {
                            break 'outer;
                        }
                        continue;
                    }

                    let summary = WorkspaceSummary {
                        id: workspace.id.to_string(),
                        phase: workspace.phase,
                        operation: workspace.operation,
                        error_reason: workspace.error_reason,
                        name: workspace.name,
                        description: workspace.description,
                        memo: workspace.memo,
                    };
                    if last_summary.as_ref() == Some(&summary) {
                        continue;
                    }
                    let body = match serde_json::to_string(&summary) {
                        Ok(body) => body,
                        Err(_) => continue,
                    };
                    last_summary = Some(summary);
                    if tx.send(Event::default().event("workspace_updated").data(body)).await.is_err() {
                        break 'outer;
                    }
                }
            }
        }

        let _: Result<(), _> = redis.xgroup_destroy(stream_key.as_str(), group.as_str()).await;
    });

    let sse = Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    ))
}
