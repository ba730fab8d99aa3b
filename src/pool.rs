//! Egress proxy pool
//!
//! Tracks the live egress proxies, how many requests each one is carrying and
//! the global number of requests in flight. Selection is least-usage with ties
//! going to the earliest proxy in pool order. When the global ceiling is
//! reached, `acquire` waits until a release frees a slot; waiters are not
//! queued, so any of them may win the freed slot.

use crate::healthcheck::ProxySource;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Error type for pool operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no valid proxies available")]
    NoProxiesAvailable,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Number of proxies in the pool
    pub total: usize,
    /// Number of proxies with at least one request in flight
    pub active_count: usize,
    /// Requests in flight across the whole pool
    pub current_concurrency: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    proxies: Vec<String>,
    usage: HashMap<String, usize>,
    active: usize,
}

/// The egress proxy pool
#[derive(Debug)]
pub struct ProxyPool {
    concurrency_limit: usize,
    static_proxies: Vec<String>,
    state: Mutex<PoolState>,
    capacity: Notify,
}

impl ProxyPool {
    /// Create an empty pool. `static_proxies` are merged into every refresh.
    pub fn new(concurrency_limit: usize, static_proxies: Vec<String>) -> Arc<Self> {
        let static_proxies = static_proxies
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        Arc::new(Self {
            concurrency_limit,
            static_proxies,
            state: Mutex::new(PoolState::default()),
            capacity: Notify::new(),
        })
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Rebuild the pool from discovered candidates plus the static list,
    /// keeping only candidates the source validates. Returns the new size.
    pub async fn refresh(&self, source: &dyn ProxySource) -> usize {
        let discovered = source.discover().await;
        let discovered_count = discovered.len();
        let candidates = merge_candidates(discovered, &self.static_proxies);
        let candidate_count = candidates.len();
        let valid = source.validate(candidates).await;

        let total = self.replace(valid);
        info!(
            discovered = discovered_count,
            candidates = candidate_count,
            total,
            "Refreshed proxy pool"
        );
        total
    }

    /// Atomically install a new proxy list and reset per-proxy usage.
    ///
    /// Requests in flight keep their slot in the global counter and give it
    /// back on release, but their per-proxy usage is forgotten.
    pub fn replace(&self, proxies: Vec<String>) -> usize {
        let proxies = merge_candidates(proxies, &[]);
        let total = proxies.len();
        {
            let mut state = self.state.lock();
            state.usage = proxies.iter().map(|p| (p.clone(), 0)).collect();
            state.proxies = proxies;
        }
        // Waiters re-check: the pool may now be empty or differently sized
        self.capacity.notify_waiters();
        total
    }

    /// Take a slot on the least used proxy, waiting while the pool is at its
    /// concurrency ceiling.
    pub async fn acquire(&self) -> Result<String, PoolError> {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Some(proxy) = self.try_acquire()? {
                return Ok(proxy);
            }

            debug!(limit = self.concurrency_limit, "Proxy pool saturated, waiting for a slot");
            notified.await;
        }
    }

    /// Non-blocking acquire. `Ok(None)` means the pool is saturated.
    pub fn try_acquire(&self) -> Result<Option<String>, PoolError> {
        let mut state = self.state.lock();
        if state.proxies.is_empty() {
            return Err(PoolError::NoProxiesAvailable);
        }
        if state.active >= self.concurrency_limit {
            return Ok(None);
        }

        let proxy = state
            .proxies
            .iter()
            .min_by_key(|p| state.usage.get(p.as_str()).copied().unwrap_or(0))
            .cloned()
            .ok_or(PoolError::NoProxiesAvailable)?;

        *state.usage.entry(proxy.clone()).or_insert(0) += 1;
        state.active += 1;

        debug!(proxy, active = state.active, "Acquired egress proxy");
        Ok(Some(proxy))
    }

    /// Give back a slot taken by [`acquire`](Self::acquire). Counters never go
    /// below zero.
    pub fn release(&self, proxy: &str) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            if let Some(usage) = state.usage.get_mut(proxy) {
                *usage = usage.saturating_sub(1);
            }
            debug!(proxy, active = state.active, "Released egress proxy");
        }
        self.capacity.notify_waiters();
    }

    /// Acquire a slot wrapped in a guard that releases it on drop
    pub async fn lease(self: &Arc<Self>) -> Result<ProxyLease, PoolError> {
        let proxy = self.acquire().await?;
        Ok(ProxyLease {
            pool: Arc::clone(self),
            proxy,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total: state.proxies.len(),
            active_count: state
                .proxies
                .iter()
                .filter(|p| state.usage.get(p.as_str()).copied().unwrap_or(0) > 0)
                .count(),
            current_concurrency: state.active,
        }
    }

    /// Current pool members in selection order
    pub fn proxies(&self) -> Vec<String> {
        self.state.lock().proxies.clone()
    }

    /// Requests currently in flight on `proxy`
    pub fn usage_of(&self, proxy: &str) -> usize {
        self.state.lock().usage.get(proxy).copied().unwrap_or(0)
    }

    /// Sum of per-proxy usage, equal to the global counter between refreshes
    pub fn total_usage(&self) -> usize {
        self.state.lock().usage.values().sum()
    }
}

/// A slot on an egress proxy, released when dropped
#[derive(Debug)]
pub struct ProxyLease {
    pool: Arc<ProxyPool>,
    proxy: String,
}

impl ProxyLease {
    pub fn proxy(&self) -> &str {
        &self.proxy
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        self.pool.release(&self.proxy);
    }
}

/// Concatenate candidate lists, dropping blanks and later duplicates
pub fn merge_candidates(discovered: Vec<String>, static_proxies: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    discovered
        .into_iter()
        .chain(static_proxies.iter().cloned())
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}
