//! First-frame auth policy and the per-source-IP rate limiter.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tickstream_proto::AuthRequest;
use tracing::info;

const IDLE_GC_THRESHOLD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed,
    Limited,
}

#[derive(Debug)]
struct RateLimiterEntry {
    attempts: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    failures: u32,
    last_activity: Instant,
}

impl RateLimiterEntry {
    fn new(now: Instant) -> Self {
        Self {
            attempts: VecDeque::new(),
            blocked_until: None,
            failures: 0,
            last_activity: now,
        }
    }
}

/// Sliding-window AUTH attempt budget per source IP, with penalty escalation
/// for repeat offenders. Sharded internally (`DashMap`) so hot IPs don't
/// serialize unrelated ones behind a single lock.
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<IpAddr, RateLimiterEntry>,
    window: Duration,
    max_attempts: u32,
}

impl RateLimiter {
    pub fn new(
        window: Duration,
        max_attempts: u32,
    ) -> Self {
        Self { entries: DashMap::new(), window, max_attempts: max_attempts.max(1) }
    }

    /// Records one AUTH attempt from `ip` and returns whether it is within
    /// budget. Call this once per AUTH frame processed, before checking
    /// credentials.
    pub fn record_attempt(
        &self,
        ip: IpAddr,
    ) -> RateLimitOutcome {
        let now = Instant::now();
        let mut entry = self.entries.entry(ip).or_insert_with(|| RateLimiterEntry::new(now));
        entry.last_activity = now;

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return RateLimitOutcome::Limited;
            }
        }

        while let Some(&front) = entry.attempts.front() {
            if now.duration_since(front) > self.window {
                entry.attempts.pop_front();
            } else {
                break;
            }
        }
        entry.attempts.push_back(now);

        if entry.attempts.len() as u32 > self.max_attempts {
            let penalty = self.window.saturating_mul(1 << entry.failures.min(16));
            let penalty = penalty.min(self.window.saturating_mul(10));
            entry.blocked_until = Some(now + penalty);
            entry.failures = entry.failures.saturating_add(1);
            return RateLimitOutcome::Limited;
        }

        RateLimitOutcome::Allowed
    }

    /// Clears history and penalty state after a successful authentication.
    pub fn reset(
        &self,
        ip: IpAddr,
    ) {
        self.entries.remove(&ip);
    }

    /// Drops entries that have seen no activity in over an hour. Intended to
    /// run on a slow background tick.
    pub fn garbage_collect(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| now.duration_since(entry.last_activity) <= IDLE_GC_THRESHOLD);
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Compares the provided credentials against the configured pair.
///
/// Uses a constant-time byte comparison so a timing side channel can't leak
/// how many leading bytes of the password matched.
pub fn credentials_match(
    configured_user: &str,
    configured_pass: &str,
    request: &AuthRequest,
) -> bool {
    constant_time_eq(configured_user.as_bytes(), request.username.as_bytes())
        & constant_time_eq(configured_pass.as_bytes(), request.password.as_bytes())
}

fn constant_time_eq(
    a: &[u8],
    b: &[u8],
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn log_auth_outcome(
    ip: IpAddr,
    success: bool,
) {
    info!(peer = %ip, success, "auth attempt processed");
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    use super::*;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn allows_attempts_within_budget() {
        let limiter = RateLimiter::new(Duration::from_millis(200), 2);
        assert_eq!(limiter.record_attempt(ip()), RateLimitOutcome::Allowed);
        assert_eq!(limiter.record_attempt(ip()), RateLimitOutcome::Allowed);
    }

    #[test]
    fn trips_after_exceeding_max_attempts() {
        let limiter = RateLimiter::new(Duration::from_millis(500), 1);
        assert_eq!(limiter.record_attempt(ip()), RateLimitOutcome::Allowed);
        assert_eq!(limiter.record_attempt(ip()), RateLimitOutcome::Limited);
    }

    #[test]
    fn reset_clears_penalty_state() {
        let limiter = RateLimiter::new(Duration::from_millis(100), 1);
        let _ = limiter.record_attempt(ip());
        let _ = limiter.record_attempt(ip());
        limiter.reset(ip());
        assert_eq!(limiter.entry_count(), 0);
        assert_eq!(limiter.record_attempt(ip()), RateLimitOutcome::Allowed);
    }

    #[test]
    fn penalty_clears_after_window_elapses() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 1);
        let _ = limiter.record_attempt(ip());
        assert_eq!(limiter.record_attempt(ip()), RateLimitOutcome::Limited);
        sleep(Duration::from_millis(350));
        assert_eq!(limiter.record_attempt(ip()), RateLimitOutcome::Allowed);
    }

    #[test]
    fn credential_comparison_is_exact() {
        let request = AuthRequest {
            username: "ok_user".to_string(),
            password: "ok_pass".to_string(),
            client_id: None,
            version: None,
        };
        assert!(credentials_match("ok_user", "ok_pass", &request));
        assert!(!credentials_match("ok_user", "wrong", &request));
    }
}
