//! Fixed-window per-client request limiting.

use super::config::RateLimitConfig;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Decision from a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u64,
}

/// Counts requests per client within fixed windows.
///
/// A client's window starts with its first request. Windows are replaced
/// lazily on the next request after they end; stale entries of idle
/// clients are dropped by [`ClientRateLimiter::purge_expired`].
#[derive(Debug)]
pub struct ClientRateLimiter {
    windows: DashMap<String, Window>,
    window: Duration,
    max_requests: u64,
}

impl ClientRateLimiter {
    /// Create a limiter from configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            window: config.window,
            max_requests: config.max_requests,
        }
    }

    /// Count a request from `client` and decide whether it may proceed.
    pub fn check(&self, client: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        let reset_after = self
            .window
            .saturating_sub(now.duration_since(entry.started));

        if entry.count >= self.max_requests {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: self.max_requests - entry.count,
            reset_after,
        }
    }

    /// Drop windows that have ended.
    pub fn purge_expired(&self) -> usize {
        let before = self.windows.len();
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u64) -> ClientRateLimiter {
        ClientRateLimiter::new(&RateLimitConfig {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_within_window() {
        let limiter = limiter(3);

        for expected in [2, 1, 0] {
            let decision = limiter.check("10.0.0.1");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = limiter.check("10.0.0.1");
        assert!(!denied.allowed);
        assert_eq!(denied.reset_after, Duration::from_secs(60));

        // Other clients are counted separately.
        assert!(limiter.check("10.0.0.2").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter(1);
        assert!(limiter.check("c").allowed);
        assert!(!limiter.check("c").allowed);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check("c").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = limiter(10);
        limiter.check("a");
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.check("b");
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
