//! PG NOTIFY -> Redis Streams transformer (spec §4.B / §4.K EventListener).
//!
//! Runs as a background task behind leader election: exactly one replica may
//! ever XADD, or every SSE subscriber would see duplicate events. The PG
//! LISTEN connection and the advisory lock share one dedicated connection for
//! the same reason coordinator writes do (spec §9).

use std::time::Duration;

use redis::AsyncCommands;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::ids::UserId;
use crate::leader::PgAdvisoryLock;

pub const CHANNEL_SSE: &str = "ws_sse";
pub const CHANNEL_WAKE: &str = "ws_wake";
pub const CHANNEL_DELETED: &str = "ws_deleted";

pub const LOCK_KEY: &str = "event_listener";
pub const STREAM_WAKE: &str = "stream:wake";
pub const STREAM_MAXLEN: usize = 1000;
pub const WAKE_STREAM_MAXLEN: usize = 100;

const LEADER_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SsePayload {
    owner_user_id: UserId,
}

/// Transforms `ws_sse` / `ws_wake` / `ws_deleted` NOTIFYs into Redis Streams
/// entries that the proxy's SSE handlers and the coordinators' wake-ups read.
pub struct EventListener {
    redis: redis::aio::ConnectionManager,
}

impl EventListener {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    /// Blocks until `shutdown` resolves. Acquires `event_listener` leadership
    /// on `lock_conn` first, retrying every [`LEADER_RETRY_INTERVAL`] while
    /// standby, then switches that same connection into LISTEN mode.
    pub async fn run(
        &mut self,
        pool: &sqlx::PgPool,
        lock: &mut PgAdvisoryLock,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let mut lock_conn = pool.acquire().await?;

        loop {
            if lock.try_acquire(&mut lock_conn, crate::leader::DEFAULT_TIMEOUT).await {
                info!("event listener became leader");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(LEADER_RETRY_INTERVAL) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
        drop(lock_conn);

        let mut listener = PgListener::connect_with(pool).await?;
        listener
            .listen_all([CHANNEL_SSE, CHANNEL_WAKE, CHANNEL_DELETED])
            .await?;
        info!(channels = 3, "event listener subscribed");

        loop {
            tokio::select! {
                notification = listener.recv() => {
                    let notification = notification?;
                    if let Err(err) = self.dispatch(notification.channel(), notification.payload()).await {
                        warn!(channel = notification.channel(), error = %err, "event dispatch failed");
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, channel: &str, payload: &str) -> Result<()> {
        match channel {
            CHANNEL_SSE => self.handle_sse(payload).await,
            CHANNEL_WAKE => self.handle_wake().await,
            CHANNEL_DELETED => self.handle_deleted(payload).await,
            other => {
                warn!(channel = other, "unexpected NOTIFY channel");
                Ok(())
            }
        }
    }

    async fn handle_sse(&mut self, payload: &str) -> Result<()> {
        let parsed: SsePayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(err) => {
                warn!(%payload, error = %err, "invalid sse notify payload");
                return Ok(());
            }
        };
        let stream_key = format!("events:{}", parsed.owner_user_id);
        self.xadd_capped(&stream_key, &[("data", payload)], STREAM_MAXLEN).await?;
        debug!(stream = %stream_key, "sse -> xadd");
        Ok(())
    }

    async fn handle_wake(&mut self) -> Result<()> {
        self.xadd_capped(STREAM_WAKE, &[("target", "ob")], WAKE_STREAM_MAXLEN).await?;
        self.xadd_capped(STREAM_WAKE, &[("target", "wc")], WAKE_STREAM_MAXLEN).await?;
        debug!(stream = STREAM_WAKE, "wake -> xadd");
        Ok(())
    }

    async fn handle_deleted(&mut self, payload: &str) -> Result<()> {
        let mut value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(err) => {
                warn!(%payload, error = %err, "invalid deleted notify payload");
                return Ok(());
            }
        };
        let owner_user_id = match value.get("owner_user_id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                warn!(%payload, "deleted payload missing owner_user_id");
                return Ok(());
            }
        };
        value["deleted"] = serde_json::Value::Bool(true);
        let stream_key = format!("events:{owner_user_id}");
        let data = serde_json::to_string(&value)?;
        self.xadd_capped(&stream_key, &[("data", data.as_str())], STREAM_MAXLEN).await?;
        debug!(stream = %stream_key, "deleted -> xadd");
        Ok(())
    }

    async fn xadd_capped(&mut self, stream: &str, fields: &[(&str, &str)], maxlen: usize) -> Result<()> {
        self.redis
            .xadd_maxlen::<_, _, _, _, ()>(
                stream,
                redis::streams::StreamMaxlen::Approx(maxlen),
                "*",
                fields,
            )
            .await
            .map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_payload_requires_owner_user_id() {
        let bad = serde_json::from_str::<SsePayload>(r#"{"id":"abc"}"#);
        assert!(bad.is_err());
    }
}
