//! Shared coordinator control flow (spec §4.K): leader election, wake-stream
//! subscription, adaptive polling. Observer, WC, and Scheduler each provide a
//! [`Coordinator`] impl; this module drives the loop identically for all
//! three, the way the source's `CoordinatorBase` does for its three
//! concrete coordinators.
//!
//! ## Connection discipline (spec §9 / ADR-012)
//!
//! The advisory lock and every tick's writes must share one `PgConnection`
//! for the loop's entire lifetime. A pool checkout per query would let the
//! pool recycle the connection out from under a coordinator that still
//! believes it holds the lock -- a "zombie lock". Callers hand this loop a
//! single connection checked out once at startup.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use sqlx::PgConnection;
use tracing::{info, warn};

use crate::error::Result;
use crate::leader::PgAdvisoryLock;

pub const IDLE_INTERVAL: Duration = Duration::from_secs(15);
pub const ACTIVE_INTERVAL: Duration = Duration::from_secs(1);
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
pub const LEADER_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const VERIFY_INTERVAL: Duration = Duration::from_secs(60);
pub const ACTIVE_DURATION: Duration = Duration::from_secs(30);

pub const STREAM_WAKE: &str = "stream:wake";
pub const CONSUMER_GROUP: &str = "coordinators";
pub const STREAM_MAXLEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeTarget {
    Ob,
    Wc,
    Gc,
}

impl WakeTarget {
    fn as_str(self) -> &'static str {
        match self {
            WakeTarget::Ob => "ob",
            WakeTarget::Wc => "wc",
            WakeTarget::Gc => "gc",
        }
    }
}

/// XADDs wake messages; called by the event listener and by coordinators
/// that want to accelerate a sibling (e.g. WC waking Observer after writing
/// a new desired_state).
pub struct NotifyPublisher {
    redis: redis::aio::ConnectionManager,
}

impl NotifyPublisher {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn publish(&mut self, target: WakeTarget) -> Result<String> {
        let id: String = self
            .redis
            .xadd_maxlen(
                STREAM_WAKE,
                redis::streams::StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[("target", target.as_str())],
            )
            .await?;
        Ok(id)
    }
}

/// Reads wake messages addressed to one target via XREADGROUP, so each
/// coordinator replica is a distinct consumer and messages are ack'd
/// exactly once across the group.
pub struct NotifySubscriber {
    redis: redis::aio::ConnectionManager,
    consumer_name: String,
    target: Option<WakeTarget>,
    group_ready: bool,
}

impl NotifySubscriber {
    pub fn new(redis: redis::aio::ConnectionManager, consumer_name: impl Into<String>) -> Self {
        Self { redis, consumer_name: consumer_name.into(), target: None, group_ready: false }
    }

    pub async fn subscribe(&mut self, target: WakeTarget) -> Result<()> {
        self.target = Some(target);
        self.ensure_group().await?;
        info!(consumer = %self.consumer_name, target = target.as_str(), "subscribed to wake stream");
        Ok(())
    }

    pub fn unsubscribe(&mut self) {
        self.target = None;
    }

    async fn ensure_group(&mut self) -> Result<()> {
        if self.group_ready {
            return Ok(());
        }
        let result: redis::RedisResult<()> = self
            .redis
            .xgroup_create_mkstream(STREAM_WAKE, CONSUMER_GROUP, "$")
            .await;
        if let Err(err) = result {
            if !err.to_string().contains("BUSYGROUP") {
                return Err(err.into());
            }
        }
        self.group_ready = true;
        Ok(())
    }

    /// Blocks up to `timeout` for a message addressed to our target.
    /// Messages for other targets are ack'd and skipped, matching the
    /// source's at-most-once-per-consumer delivery.
    pub async fn get_message(&mut self, timeout: Duration) -> Result<Option<WakeTarget>> {
        let Some(target) = self.target else { return Ok(None) };
        self.ensure_group().await?;

        let opts = redis::streams::StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer_name)
            .count(10)
            .block(timeout.as_millis() as usize);

        let reply: redis::streams::StreamReadReply = match self
            .redis
            .xread_options(&[STREAM_WAKE], &[">"], &opts)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "error reading wake stream");
                return Ok(None);
            }
        };

        let mut matched = None;
        for stream in reply.keys {
            for entry in stream.ids {
                let raw: Option<String> = entry.map.get("target").and_then(|v| {
                    redis::from_redis_value::<String>(v).ok()
                });
                let _: Result<(), _> = self
                    .redis
                    .xack(STREAM_WAKE, CONSUMER_GROUP, &[entry.id.clone()])
                    .await
                    .map_err(|e| warn!(error = %e, "xack failed"));
                if raw.as_deref() == Some(target.as_str()) {
                    matched = Some(target);
                }
            }
        }
        Ok(matched)
    }
}

/// Per-coordinator reconciliation step. Implementors own their query/update
/// logic; the loop owns scheduling, leadership, and wake delivery.
#[async_trait]
pub trait Coordinator: Send {
    const LOCK_KEY: &'static str;
    const WAKE_TARGET: Option<WakeTarget> = None;

    async fn tick(&mut self, conn: &mut PgConnection) -> Result<()>;
}

/// Drives a [`Coordinator`] forever, until `shutdown` fires. Not `Send`
/// across an await boundary by itself -- callers `tokio::spawn` this inside
/// an async move block that owns the connection.
pub struct CoordinatorLoop<C: Coordinator> {
    coordinator: C,
    conn: PgConnection,
    leader: PgAdvisoryLock,
    notify: Option<NotifySubscriber>,
    subscribed: bool,
    active_until: Instant,
    last_verify: Option<Instant>,
    last_tick: Option<Instant>,
}

impl<C: Coordinator> CoordinatorLoop<C> {
    pub fn new(coordinator: C, conn: PgConnection, notify: Option<NotifySubscriber>) -> Self {
        Self {
            coordinator,
            conn,
            leader: PgAdvisoryLock::new(C::LOCK_KEY),
            notify,
            subscribed: false,
            active_until: Instant::now() + ACTIVE_DURATION,
            last_verify: None,
            last_tick: None,
        }
    }

    fn is_active(&self) -> bool {
        Instant::now() < self.active_until
    }

    fn accelerate(&mut self) {
        self.active_until = Instant::now() + ACTIVE_DURATION;
        info!(coordinator = C::LOCK_KEY, "accelerating poll interval");
    }

    fn interval(&self) -> Duration {
        if self.is_active() { ACTIVE_INTERVAL } else { IDLE_INTERVAL }
    }

    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(coordinator = C::LOCK_KEY, "starting coordinator loop");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.ensure_leadership().await {
                if tokio::select! {
                    _ = tokio::time::sleep(LEADER_RETRY_INTERVAL) => false,
                    _ = shutdown.changed() => true,
                } {
                    break;
                }
                continue;
            }

            self.ensure_subscribed().await;
            self.throttle().await;

            if let Err(err) = self.coordinator.tick(&mut self.conn).await {
                warn!(coordinator = C::LOCK_KEY, error = %err, "tick failed");
            }
            self.last_tick = Some(Instant::now());

            if tokio::select! {
                () = self.wait_for_notify(self.interval()) => false,
                _ = shutdown.changed() => true,
            } {
                break;
            }
        }
        self.cleanup().await;
    }

    async fn ensure_leadership(&mut self) -> bool {
        let now = Instant::now();
        let within_verify_window = self
            .last_verify
            .map(|t| now.duration_since(t) <= VERIFY_INTERVAL)
            .unwrap_or(false);
        if within_verify_window && self.leader.is_leader() {
            return true;
        }

        // Already leader: re-verify against pg_locks rather than re-acquire,
        // so an externally forced release (pg_terminate_backend, a stray
        // pg_advisory_unlock) is actually detected (spec §4.A, §4.K).
        if self.leader.is_leader() {
            let still_holding = self.leader.verify_holding(&mut self.conn).await;
            if !still_holding {
                self.release_subscription().await;
                return false;
            }
            self.last_verify = Some(now);
            return true;
        }

        let acquired = self.leader.try_acquire(&mut self.conn, crate::leader::DEFAULT_TIMEOUT).await;
        if !acquired {
            self.release_subscription().await;
            return false;
        }
        self.last_verify = Some(now);
        true
    }

    async fn ensure_subscribed(&mut self) {
        if self.subscribed || C::WAKE_TARGET.is_none() {
            return;
        }
        if let Some(notify) = self.notify.as_mut() {
            if let Err(err) = notify.subscribe(C::WAKE_TARGET.unwrap()).await {
                warn!(coordinator = C::LOCK_KEY, error = %err, "failed to subscribe to wake stream");
                return;
            }
            self.subscribed = true;
        }
    }

    async fn throttle(&self) {
        if let Some(last) = self.last_tick {
            let elapsed = last.elapsed();
            if elapsed < MIN_INTERVAL {
                tokio::time::sleep(MIN_INTERVAL - elapsed).await;
            }
        }
    }

    async fn wait_for_notify(&mut self, interval: Duration) {
        let Some(notify) = self.notify.as_mut() else {
            tokio::time::sleep(interval).await;
            return;
        };
        if C::WAKE_TARGET.is_none() {
            tokio::time::sleep(interval).await;
            return;
        }
        match notify.get_message(interval).await {
            Ok(Some(_)) => self.accelerate(),
            Ok(None) => {}
            Err(err) => {
                warn!(coordinator = C::LOCK_KEY, error = %err, "error polling wake stream");
                tokio::time::sleep(interval).await;
            }
        }
    }

    async fn release_subscription(&mut self) {
        if self.subscribed {
            if let Some(notify) = self.notify.as_mut() {
                notify.unsubscribe();
            }
            self.subscribed = false;
        }
    }

    async fn cleanup(&mut self) {
        info!(coordinator = C::LOCK_KEY, "cleaning up coordinator loop");
        self.release_subscription().await;
        self.leader.release(&mut self.conn, crate::leader::DEFAULT_TIMEOUT).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_target_strings_match_stream_protocol() {
        assert_eq!(WakeTarget::Ob.as_str(), "ob");
        assert_eq!(WakeTarget::Wc.as_str(), "wc");
        assert_eq!(WakeTarget::Gc.as_str(), "gc");
    }
}
