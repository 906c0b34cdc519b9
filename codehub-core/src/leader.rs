//! Session-scoped PostgreSQL advisory lock leader election (spec §4.A).
//!
//! The lock must live on the same connection used for the coordinator's
//! writes (spec §9): a pool checkout per query would let the lock be
//! silently dropped by the pool recycling the connection underneath a
//! "leader". Callers own a dedicated `PgConnection` and hand it to
//! `PgAdvisoryLock` for the coordinator's entire lifetime.

use sha2::{Digest, Sha256};
use sqlx::{PgConnection, Row};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

fn compute_lock_id(lock_key: &str) -> i64 {
    let digest = Sha256::digest(lock_key.as_bytes());
    let high_bytes: [u8; 8] = digest[..8].try_into().expect("sha256 digest is 32 bytes");
    (u64::from_be_bytes(high_bytes) & 0x7FFF_FFFF_FFFF_FFFF) as i64
}

/// A non-blocking, session-scoped exclusive lock identified by a string role
/// key. At most one holder of a given key can exist across all replicas.
pub struct PgAdvisoryLock {
    lock_key: String,
    lock_id: i64,
    is_leader: bool,
}

impl PgAdvisoryLock {
    pub fn new(lock_key: impl Into<String>) -> Self {
        let lock_key = lock_key.into();
        let lock_id = compute_lock_id(&lock_key);
        Self { lock_key, lock_id, is_leader: false }
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Non-blocking acquire. Re-entrant: returns `true` immediately without
    /// touching the database if leadership is already held.
    pub async fn try_acquire(&mut self, conn: &mut PgConnection, acquire_timeout: Duration) -> bool {
        if self.is_leader {
            return true;
        }

        let acquired = match timeout(
            acquire_timeout,
            sqlx::query("SELECT pg_try_advisory_lock($1)")
                .bind(self.lock_id)
                .fetch_one(&mut *conn),
        )
        .await
        {
            Ok(Ok(row)) => row.try_get::<bool, _>(0).unwrap_or(false),
            Ok(Err(err)) => {
                warn!(lock = %self.lock_key, error = %err, "leadership acquire error");
                false
            }
            Err(_) => {
                warn!(lock = %self.lock_key, "leadership acquire timeout");
                false
            }
        };

        if acquired && !self.is_leader {
            info!(lock = %self.lock_key, lock_id = self.lock_id, "acquired leadership");
        } else if !acquired && self.is_leader {
            warn!(lock = %self.lock_key, "lost leadership");
        }
        self.is_leader = acquired;
        acquired
    }

    /// Releases the lock. Warns (does not error) if the underlying release
    /// reports the lock was not held.
    pub async fn release(&mut self, conn: &mut PgConnection, release_timeout: Duration) {
        if !self.is_leader {
            return;
        }

        match timeout(
            release_timeout,
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_id)
                .fetch_one(&mut *conn),
        )
        .await
        {
            Ok(Ok(row)) => {
                let released: bool = row.try_get(0).unwrap_or(false);
                if !released {
                    warn!(lock = %self.lock_key, "lock was not held during release");
                }
            }
            Ok(Err(err)) => warn!(lock = %self.lock_key, error = %err, "leadership release error"),
            Err(_) => warn!(lock = %self.lock_key, "leadership release timeout"),
        }

        self.is_leader = false;
        info!(lock = %self.lock_key, "released leadership");
    }

    /// Confirms against `pg_locks` on this same connection that we still
    /// hold the lock, detecting an externally forced release (e.g. another
    /// session issuing `pg_terminate_backend`).
    pub async fn verify_holding(&mut self, conn: &mut PgConnection) -> bool {
        if !self.is_leader {
            return false;
        }

        let query = sqlx::query(
            "SELECT EXISTS(
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                  AND (classid::bigint << 32) | (objid::bigint & x'FFFFFFFF'::bigint) = $1
                  AND objsubid = 1
                  AND pid = pg_backend_pid()
                  AND granted = true
            )",
        )
        .bind(self.lock_id)
        .fetch_one(&mut *conn);

        let holding = match timeout(VERIFY_TIMEOUT, query).await {
            Ok(Ok(row)) => row.try_get::<bool, _>(0).unwrap_or(false),
            Ok(Err(err)) => {
                warn!(lock = %self.lock_key, error = %err, "leadership verify error");
                self.is_leader = false;
                return false;
            }
            Err(_) => {
                warn!(lock = %self.lock_key, "leadership verify timeout");
                self.is_leader = false;
                return false;
            }
        };

        if !holding {
            warn!(lock = %self.lock_key, "leadership lost, detected via pg_locks");
            self.is_leader = false;
        }
        holding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_id_is_deterministic_and_non_negative() {
        let a = compute_lock_id("wc");
        let b = compute_lock_id("wc");
        assert_eq!(a, b);
        assert!(a >= 0);
    }

    #[test]
    fn different_keys_yield_different_lock_ids() {
        assert_ne!(compute_lock_id("wc"), compute_lock_id("observer"));
    }

    #[test]
    fn fresh_lock_is_not_leader() {
        let lock = PgAdvisoryLock::new("event_listener");
        assert!(!lock.is_leader());
    }
}
