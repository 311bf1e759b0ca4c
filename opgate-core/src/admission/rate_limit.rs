// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::config::RateLimitConfig;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Request timestamps inside the trailing window for one connection.
#[derive(Debug, Default)]
struct RateWindow {
    requests: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.requests.front() {
            if now.duration_since(*oldest) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub connections: u64,
    pub max_requests: usize,
    pub window_ms: u64,
}

/// Per-connection sliding-window limiter.
///
/// Windows live in a bounded moka cache; a connection idle for ten windows is
/// forgotten.
pub struct RateLimiter {
    enabled: bool,
    max_requests: usize,
    window: Duration,
    windows: Cache<String, Arc<Mutex<RateWindow>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let window = Duration::from_millis(config.window_ms);
        let windows = Cache::builder()
            .max_capacity(config.max_connections)
            .time_to_idle(window * 10)
            .build();

        Self {
            enabled: config.enabled,
            max_requests: config.max_requests,
            window,
            windows,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check and, when allowed, record a request for `connection_id`.
    ///
    /// A disabled limiter still maintains windows but never denies.
    pub fn check_limit(&self, connection_id: &str) -> RateLimitDecision {
        let entry = self
            .windows
            .get_with(connection_id.to_string(), || Arc::new(Mutex::new(RateWindow::default())));
        let mut window = entry.lock();
        let now = Instant::now();
        window.prune(now, self.window);

        if window.requests.len() < self.max_requests {
            window.requests.push_back(now);
            return RateLimitDecision {
                allowed: true,
                retry_after: Duration::ZERO,
            };
        }

        if !self.enabled {
            return RateLimitDecision {
                allowed: true,
                retry_after: Duration::ZERO,
            };
        }

        let retry_after = window
            .requests
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(self.window);
        warn!(
            connection = %connection_id,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate limit exceeded"
        );
        RateLimitDecision {
            allowed: false,
            retry_after,
        }
    }

    /// Forget the window for one connection.
    pub fn reset(&self, connection_id: &str) {
        self.windows.invalidate(connection_id);
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.windows.run_pending_tasks();
        RateLimiterStats {
            enabled: self.enabled,
            connections: self.windows.entry_count(),
            max_requests: self.max_requests,
            window_ms: self.window.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(enabled: bool, max_requests: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled,
            max_requests,
            window_ms,
            max_connections: 100,
        })
    }

    #[test]
    fn test_denies_after_max_requests() {
        let limiter = limiter(true, 3, 1000);
        for _ in 0..3 {
            assert!(limiter.check_limit("conn").allowed);
        }
        let denied = limiter.check_limit("conn");
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_millis(1000));
    }

    #[test]
    fn test_connections_are_independent() {
        let limiter = limiter(true, 1, 1000);
        assert!(limiter.check_limit("a").allowed);
        assert!(limiter.check_limit("b").allowed);
        assert!(!limiter.check_limit("a").allowed);
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(true, 3, 50);
        for _ in 0..3 {
            assert!(limiter.check_limit("conn").allowed);
        }
        assert!(!limiter.check_limit("conn").allowed);
        std::thread::sleep(Duration::from_millis(70));
        assert!(limiter.check_limit("conn").allowed);
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = limiter(false, 1, 1000);
        for _ in 0..5 {
            let decision = limiter.check_limit("conn");
            assert!(decision.allowed);
            assert_eq!(decision.retry_after, Duration::ZERO);
        }
        assert_eq!(limiter.stats().connections, 1);
    }

    #[test]
    fn test_reset_clears_window() {
        let limiter = limiter(true, 1, 1000);
        assert!(limiter.check_limit("conn").allowed);
        assert!(!limiter.check_limit("conn").allowed);
        limiter.reset("conn");
        assert!(limiter.check_limit("conn").allowed);
    }
}
