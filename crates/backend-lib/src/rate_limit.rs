// ============================
// crates/backend-lib/src/rate_limit.rs
// ============================
//! Sliding-window rate limiting.
//!
//! A [`RateLimitPolicy`] is explicit configuration (`window`,
//! `max_requests`) handed to the lifecycle controller, keyed by an
//! arbitrary string (user id here).

use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct WindowEntry {
    requests: u32,
    window_start: Instant,
}

/// Fixed-window request counter over a concurrent map.
#[derive(Debug)]
pub struct RateLimitPolicy {
    windows: DashMap<String, WindowEntry>,
    window: Duration,
    max_requests: u32,
}

impl RateLimitPolicy {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
        }
    }

    /// Record one request for `key`. Returns `false` when the key has
    /// exhausted its window.
    pub fn check_and_record(&self, key: &str) -> bool {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                requests: 0,
                window_start: Instant::now(),
            });

        if entry.window_start.elapsed() > self.window {
            entry.requests = 0;
            entry.window_start = Instant::now();
        }

        if entry.requests >= self.max_requests {
            return false;
        }

        entry.requests += 1;
        true
    }

    /// Drop windows that have been idle for more than one full window.
    pub fn cleanup(&self) {
        let window = self.window;
        self.windows
            .retain(|_, entry| entry.window_start.elapsed() <= window * 2);
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
