//! Admission control: the blacklist and rate limit gate applied before any
//! forwarding work, plus the hook used to feed protocol violations back into
//! the blacklist.

use crate::config::AdmissionConfig;
use crate::error::ProxyErrorCode;
use crate::ipguard::IpGuard;
use crate::ratelimit::RateLimiter;
use chrono::Utc;

/// Outcome of the admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Blacklisted,
    RateLimited,
}

impl Admission {
    /// Error code for a rejection, `None` when admitted
    pub fn rejection(&self) -> Option<ProxyErrorCode> {
        match self {
            Admission::Admitted => None,
            Admission::Blacklisted => Some(ProxyErrorCode::IpBlacklisted),
            Admission::RateLimited => Some(ProxyErrorCode::RateLimited),
        }
    }
}

/// Owns the rate limiter and the IP guard
#[derive(Debug)]
pub struct AdmissionControl {
    limiter: RateLimiter,
    guard: IpGuard,
}

impl AdmissionControl {
    pub fn new(limiter: RateLimiter, guard: IpGuard) -> Self {
        Self { limiter, guard }
    }

    /// Build from configuration, loading the persisted blacklist
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(
            RateLimiter::new(config.rate_limit_requests, config.rate_limit_interval()),
            IpGuard::load(
                &config.blacklist_path,
                config.ip_error_threshold,
                config.error_window(),
            ),
        )
    }

    /// Blacklist first, then the rate limit. Blacklisted sources are not
    /// counted against their rate limit.
    pub fn check(&self, source: &str) -> Admission {
        if self.guard.is_blacklisted(source) {
            return Admission::Blacklisted;
        }
        if self.limiter.is_rate_limited(source) {
            return Admission::RateLimited;
        }
        Admission::Admitted
    }

    pub fn is_blacklisted(&self, source: &str) -> bool {
        self.guard.is_blacklisted(source)
    }

    pub fn is_rate_limited(&self, source: &str) -> bool {
        self.limiter.is_rate_limited(source)
    }

    pub fn record_error(&self, source: &str, error_type: &str) -> bool {
        self.guard.record_error(source, error_type)
    }

    pub fn sweep_errors(&self) -> usize {
        self.guard.sweep_errors(Utc::now().timestamp_millis())
    }

    pub fn ip_guard(&self) -> &IpGuard {
        &self.guard
    }
}
