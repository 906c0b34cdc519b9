//! Shared retry classification and backoff so WC, Scheduler, and the Proxy
//! agree on what is retryable (spec §7).

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connect/read timeouts, 5xx, 429, storage throttling, "volume in use" --
    /// retry with backoff.
    Transient,
    /// 4xx (except 429), access-denied, invalid input -- never retry.
    Permanent,
}

/// Classifies an HTTP-shaped status code the way every retrying caller in
/// this system must agree on.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

/// Exponential backoff doubling from `base` to `cap`, multiplied by a
/// uniform 50-150% jitter factor so a thundering herd of retries doesn't
/// reconverge in lockstep.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    /// The delay to sleep before the next attempt, advancing internal state.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped.as_secs_f64() * jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_and_5xx_as_transient() {
        assert_eq!(classify_http_status(429), ErrorClass::Transient);
        assert_eq!(classify_http_status(503), ErrorClass::Transient);
        assert_eq!(classify_http_status(500), ErrorClass::Transient);
    }

    #[test]
    fn classifies_other_4xx_as_permanent() {
        assert_eq!(classify_http_status(400), ErrorClass::Permanent);
        assert_eq!(classify_http_status(403), ErrorClass::Permanent);
        assert_eq!(classify_http_status(404), ErrorClass::Permanent);
    }

    #[test]
    fn backoff_never_exceeds_cap_even_with_max_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn backoff_grows_across_early_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        // With 50-150% jitter the ranges still don't overlap for a pure doubling this early.
        assert!(first <= Duration::from_millis(150));
        assert!(second >= Duration::from_millis(100));
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(150));
    }
}
