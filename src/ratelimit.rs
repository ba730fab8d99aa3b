//! Fixed-window rate limiting per source address
//!
//! Each source gets a counter and a reset instant. The first request after the
//! reset instant opens a new window. Requests over the limit are rejected but
//! still counted. Because windows are fixed rather than sliding, a source can
//! get up to twice the limit through across a window boundary.

use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Per-source fixed-window request counter
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    interval: Duration,
    clients: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            clients: DashMap::new(),
        }
    }

    /// Count a request from `client` and report whether it is over the limit
    pub fn is_rate_limited(&self, client: &str) -> bool {
        self.is_rate_limited_at(client, Instant::now())
    }

    /// Same as [`is_rate_limited`](Self::is_rate_limited) with an explicit clock
    pub fn is_rate_limited_at(&self, client: &str, now: Instant) -> bool {
        let mut entry = self.clients.entry(client.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + self.interval,
        });
        let window = entry.value_mut();

        if window.count == 0 || now > window.reset_at {
            window.count = 1;
            window.reset_at = now + self.interval;
            return false;
        }

        window.count = window.count.saturating_add(1);
        window.count > self.limit
    }

    /// Number of sources currently tracked
    pub fn tracked_sources(&self) -> usize {
        self.clients.len()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}
