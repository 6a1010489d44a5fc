//! Rate Limiting (C9): a fixed-window limiter keyed by an identifier plus a
//! policy (general API traffic vs. workflow execution), each with its own
//! window and limit. Guarded state behind a single `Mutex<HashMap<..>>`,
//! the same shared-guarded-state idiom the transport layer uses for its
//! cancellation flag, just generalized from a flag to a counter map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Which counter space a check applies to. Kept distinct so a burst of
/// workflow executions can't also exhaust a caller's budget for ordinary
/// API reads, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Api,
    WorkflowExecution,
}

#[derive(Debug, Clone, Copy)]
struct PolicyLimits {
    max_requests: u32,
    window: Duration,
}

struct RateLimitEntry {
    window_start: Instant,
    count: u32,
}

/// `CheckAndIncrement(policy, identifier) → bool` (§4.9).
///
/// Each `(policy, identifier)` pair gets its own fixed window: the first
/// request in a window starts the clock; once `window` elapses, the next
/// check resets the counter rather than sliding it. Garbage collection of
/// expired entries is opportunistic — done inline on each check, not on a
/// background timer — so the limiter never needs a reaper task.
pub struct RateLimiter {
    enabled: bool,
    limits: HashMap<Policy, PolicyLimits>,
    entries: Mutex<HashMap<(Policy, String), RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            limits: HashMap::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: Policy, max_requests: u32, window: Duration) -> Self {
        self.limits.insert(policy, PolicyLimits { max_requests, window });
        self
    }

    /// Returns `true` if the request under `(policy, identifier)` is allowed
    /// and counts toward the window; `false` if the window's budget is
    /// already spent. When the limiter is globally disabled, always `true`
    /// and no state is recorded.
    pub fn check_and_increment(&self, policy: Policy, identifier: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(limits) = self.limits.get(&policy).copied() else {
            return true;
        };

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        // Opportunistic GC: drop any window that expired strictly before
        // this check, regardless of whether it belongs to this key.
        entries.retain(|_, entry| now.duration_since(entry.window_start) < limits.window);

        let key = (policy, identifier.to_string());
        match entries.get_mut(&key) {
            Some(entry) => {
                if entry.count < limits.max_requests {
                    entry.count += 1;
                    true
                } else {
                    false
                }
            }
            None => {
                entries.insert(
                    key,
                    RateLimitEntry {
                        window_start: now,
                        count: 1,
                    },
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(true).with_policy(Policy::Api, max, window)
    }

    #[test]
    fn allows_requests_up_to_the_limit() {
        let rl = limiter(2, Duration::from_secs(60));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
        assert!(!rl.check_and_increment(Policy::Api, "user-1"));
    }

    #[test]
    fn tracks_identifiers_independently() {
        let rl = limiter(1, Duration::from_secs(60));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
        assert!(rl.check_and_increment(Policy::Api, "user-2"));
        assert!(!rl.check_and_increment(Policy::Api, "user-1"));
    }

    #[test]
    fn tracks_policies_independently() {
        let rl = RateLimiter::new(true)
            .with_policy(Policy::Api, 1, Duration::from_secs(60))
            .with_policy(Policy::WorkflowExecution, 1, Duration::from_secs(60));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
        assert!(rl.check_and_increment(Policy::WorkflowExecution, "user-1"));
        assert!(!rl.check_and_increment(Policy::Api, "user-1"));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let rl = RateLimiter::new(false).with_policy(Policy::Api, 1, Duration::from_secs(60));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
    }

    #[test]
    fn unconfigured_policy_always_allows() {
        let rl = RateLimiter::new(true);
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
    }

    #[test]
    fn window_reset_allows_requests_again() {
        let rl = limiter(1, Duration::from_millis(20));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
        assert!(!rl.check_and_increment(Policy::Api, "user-1"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(rl.check_and_increment(Policy::Api, "user-1"));
    }
}
