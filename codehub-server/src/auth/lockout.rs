//! Per-username login lockout (spec §7, §4.L, §8 scenario 7): 5 consecutive
//! failures locks the account for a configurable window; a success anywhere
//! resets the counter; a locked-out request increments nothing further.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry {
    failures: u32,
    locked_until: Option<Instant>,
}

pub struct LoginLockout {
    threshold: u32,
    window: Duration,
    entries: DashMap<String, Entry>,
}

impl LoginLockout {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self { threshold, window, entries: DashMap::new() }
    }

    /// `Some(retry_after_secs)` if `username` is currently locked out.
    pub fn check(&self, username: &str) -> Option<u64> {
        let entry = self.entries.get(username)?;
        let locked_until = entry.locked_until?;
        let now = Instant::now();
        if now >= locked_until {
            return None;
        }
        Some((locked_until - now).as_secs().max(1))
    }

    /// Records a failed attempt; locks the account once `threshold`
    /// consecutive failures have been seen without an intervening success.
    pub fn record_failure(&self, username: &str) {
        let mut entry = self.entries.entry(username.to_string()).or_insert(Entry { failures: 0, locked_until: None });
        entry.failures += 1;
        if entry.failures >= self.threshold {
            entry.locked_until = Some(Instant::now() + self.window);
        }
    }

    /// A successful login resets the counter to zero regardless of state.
    pub fn record_success(&self, username: &str) {
        self.entries.remove(username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_out_after_threshold_consecutive_failures() {
        let lockout = LoginLockout::new(5, Duration::from_secs(900));
        for _ in 0..4 {
            lockout.record_failure("alice");
        }
        assert!(lockout.check("alice").is_none());
        lockout.record_failure("alice");
        assert!(lockout.check("alice").is_some());
    }

    #[test]
    fn success_resets_failure_counter() {
        let lockout = LoginLockout::new(5, Duration::from_secs(900));
        for _ in 0..4 {
            lockout.record_failure("bob");
        }
        lockout.record_success("bob");
        lockout.record_failure("bob");
        assert!(lockout.check("bob").is_none());
    }

    #[test]
    fn unknown_username_is_never_locked() {
        let lockout = LoginLockout::new(5, Duration::from_secs(900));
        assert!(lockout.check("nobody").is_none());
    }
}
