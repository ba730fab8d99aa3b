//! IP error tracking and blacklisting
//!
//! Errors attributed to a source address are counted. Once an address reaches
//! the threshold with its first and latest error inside the window, it is
//! blacklisted permanently. Counter entries whose last error is older than
//! the window are purged by [`IpGuard::sweep_errors`]; blacklist membership is
//! not affected by the sweep.
//!
//! State is persisted as a single JSON document, rewritten wholesale on every
//! promotion and on every sweep that removed something. Writes happen on a
//! blocking task when a runtime is available and never fail the caller.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Error counter entry for one source address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpErrorEntry {
    pub count: u32,
    /// Unix epoch milliseconds
    pub first_error: i64,
    /// Unix epoch milliseconds
    pub last_error: i64,
    /// Category of the most recent error
    pub error_type: String,
}

/// On-disk layout of the blacklist file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpDocument {
    #[serde(default, alias = "blacks")]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub ip_error_counter: HashMap<String, IpErrorEntry>,
}

#[derive(Debug, Default)]
struct IpState {
    blacklist: BTreeSet<String>,
    counters: HashMap<String, IpErrorEntry>,
}

impl IpState {
    fn to_document(&self) -> IpDocument {
        IpDocument {
            blacklist: self.blacklist.iter().cloned().collect(),
            ip_error_counter: self.counters.clone(),
        }
    }
}

/// Serializes document writes so an older snapshot never overwrites a newer one
#[derive(Debug)]
struct Persister {
    path: PathBuf,
    generation: AtomicU64,
    written: Mutex<u64>,
}

impl Persister {
    fn write(&self, generation: u64, bytes: &[u8]) {
        let mut written = self.written.lock();
        if generation <= *written {
            debug!(generation, "Skipping stale IP data snapshot");
            return;
        }

        let tmp = self.path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, &self.path));
        match result {
            Ok(()) => {
                *written = generation;
                debug!(path = %self.path.display(), "IP data saved");
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to save IP data");
            }
        }
    }
}

/// Blacklist and per-IP error counter
#[derive(Debug)]
pub struct IpGuard {
    threshold: u32,
    window_ms: i64,
    state: Mutex<IpState>,
    persister: Option<Arc<Persister>>,
}

impl IpGuard {
    /// Create a guard that keeps everything in memory
    pub fn in_memory(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window_ms: duration_ms(window),
            state: Mutex::new(IpState::default()),
            persister: None,
        }
    }

    /// Create a guard backed by the JSON document at `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file is logged
    /// and also starts empty.
    pub fn load(path: impl AsRef<Path>, threshold: u32, window: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<IpDocument>(&bytes) {
                Ok(doc) => {
                    info!(
                        path = %path.display(),
                        blacklisted = doc.blacklist.len(),
                        tracked = doc.ip_error_counter.len(),
                        "IP data loaded"
                    );
                    IpState {
                        blacklist: doc.blacklist.into_iter().collect(),
                        counters: doc.ip_error_counter,
                    }
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to parse IP data file");
                    IpState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "IP data file not found, starting empty");
                IpState::default()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read IP data file");
                IpState::default()
            }
        };

        Self {
            threshold,
            window_ms: duration_ms(window),
            state: Mutex::new(state),
            persister: Some(Arc::new(Persister {
                path,
                generation: AtomicU64::new(0),
                written: Mutex::new(0),
            })),
        }
    }

    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.state.lock().blacklist.contains(ip)
    }

    /// Record an error against `ip`. Returns true if the address is blacklisted
    /// as a result of this call.
    pub fn record_error(&self, ip: &str, error_type: &str) -> bool {
        self.record_error_at(ip, error_type, Utc::now().timestamp_millis())
    }

    /// Same as [`record_error`](Self::record_error) with an explicit clock
    pub fn record_error_at(&self, ip: &str, error_type: &str, now_ms: i64) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            let entry = state
                .counters
                .entry(ip.to_string())
                .or_insert_with(|| IpErrorEntry {
                    count: 0,
                    first_error: now_ms,
                    last_error: now_ms,
                    error_type: error_type.to_string(),
                });
            entry.count = entry.count.saturating_add(1);
            entry.last_error = now_ms;
            entry.error_type = error_type.to_string();

            let count = entry.count;
            let within_window = now_ms - entry.first_error <= self.window_ms;
            debug!(ip, error_type, count, "Recorded IP error");

            if count < self.threshold || !within_window {
                return false;
            }

            state.blacklist.insert(ip.to_string());
            warn!(ip, error_type, count, "IP added to blacklist");
            state.to_document()
        };

        self.save(snapshot);
        true
    }

    /// Purge counter entries whose last error is older than the window.
    /// Returns how many entries were removed.
    pub fn sweep_errors(&self, now_ms: i64) -> usize {
        let snapshot = {
            let mut state = self.state.lock();
            let before = state.counters.len();
            let window_ms = self.window_ms;
            state
                .counters
                .retain(|_, entry| now_ms - entry.last_error <= window_ms);
            let removed = before - state.counters.len();
            if removed == 0 {
                return 0;
            }
            info!(removed, remaining = state.counters.len(), "Purged stale IP error counters");
            (removed, state.to_document())
        };

        let (removed, doc) = snapshot;
        self.save(doc);
        removed
    }

    /// Current error counter entry for `ip`, if any
    pub fn error_entry(&self, ip: &str) -> Option<IpErrorEntry> {
        self.state.lock().counters.get(ip).cloned()
    }

    /// Current persisted view of the state
    pub fn document(&self) -> IpDocument {
        self.state.lock().to_document()
    }

    fn save(&self, doc: IpDocument) {
        let Some(persister) = self.persister.as_ref() else {
            return;
        };

        let bytes = match serde_json::to_vec_pretty(&doc) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize IP data");
                return;
            }
        };
        let generation = persister.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let persister = Arc::clone(persister);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || persister.write(generation, &bytes));
            }
            Err(_) => persister.write(generation, &bytes),
        }
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);
    const DAY_MS: i64 = 86_400_000;

    #[test]
    fn test_blacklisted_after_threshold() {
        let guard = IpGuard::in_memory(3, DAY);
        let t0 = 1_700_000_000_000;

        assert!(!guard.record_error_at("1.2.3.4", "missing_api_key", t0));
        assert!(!guard.record_error_at("1.2.3.4", "missing_api_key", t0 + 10));
        assert!(!guard.is_blacklisted("1.2.3.4"));
        assert!(guard.record_error_at("1.2.3.4", "unsupported_path", t0 + 20));
        assert!(guard.is_blacklisted("1.2.3.4"));

        let entry = guard.error_entry("1.2.3.4").unwrap();
        assert_eq!(entry.count, 3);
        assert_eq!(entry.first_error, t0);
        assert_eq!(entry.last_error, t0 + 20);
        assert_eq!(entry.error_type, "unsupported_path");
    }

    #[test]
    fn test_errors_spread_beyond_window_do_not_blacklist() {
        let guard = IpGuard::in_memory(2, DAY);
        let t0 = 1_700_000_000_000;

        guard.record_error_at("5.5.5.5", "missing_authorization", t0);
        assert!(!guard.record_error_at("5.5.5.5", "missing_authorization", t0 + DAY_MS + 1));
        assert!(!guard.is_blacklisted("5.5.5.5"));
    }

    #[test]
    fn test_sweep_purges_stale_counters_but_keeps_blacklist() {
        let guard = IpGuard::in_memory(1, DAY);
        let t0 = 1_700_000_000_000;

        guard.record_error_at("9.9.9.9", "missing_api_key", t0);
        guard.record_error_at("8.8.8.8", "missing_api_key", t0 + DAY_MS);
        assert!(guard.is_blacklisted("9.9.9.9"));

        assert_eq!(guard.sweep_errors(t0 + DAY_MS), 0);
        assert_eq!(guard.sweep_errors(t0 + DAY_MS + 1), 1);

        assert!(guard.error_entry("9.9.9.9").is_none());
        assert!(guard.error_entry("8.8.8.8").is_some());
        assert!(guard.is_blacklisted("9.9.9.9"));
    }

    #[test]
    fn test_blacklist_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("black.json");

        {
            let guard = IpGuard::load(&path, 2, DAY);
            guard.record_error("7.7.7.7", "missing_api_key");
            guard.record_error("7.7.7.7", "missing_api_key");
            assert!(guard.is_blacklisted("7.7.7.7"));
        }

        let reloaded = IpGuard::load(&path, 2, DAY);
        assert!(reloaded.is_blacklisted("7.7.7.7"));
        assert_eq!(reloaded.error_entry("7.7.7.7").unwrap().count, 2);
        assert!(!reloaded.is_blacklisted("1.1.1.1"));
    }

    #[test]
    fn test_document_layout() {
        let guard = IpGuard::in_memory(1, DAY);
        guard.record_error_at("2.2.2.2", "missing_beta_header", 1000);

        let json = serde_json::to_value(guard.document()).unwrap();
        assert_eq!(json["blacklist"], serde_json::json!(["2.2.2.2"]));
        let entry = &json["ip_error_counter"]["2.2.2.2"];
        assert_eq!(entry["count"], 1);
        assert_eq!(entry["firstError"], 1000);
        assert_eq!(entry["lastError"], 1000);
        assert_eq!(entry["errorType"], "missing_beta_header");
    }

    #[test]
    fn test_load_accepts_legacy_blacks_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("black.json");
        std::fs::write(&path, r#"{"blacks": ["3.3.3.3"], "ip_error_counter": {}}"#).unwrap();

        let guard = IpGuard::load(&path, 10, DAY);
        assert!(guard.is_blacklisted("3.3.3.3"));
    }

    #[test]
    fn test_load_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("black.json");
        std::fs::write(&path, "not json").unwrap();

        let guard = IpGuard::load(&path, 10, DAY);
        assert!(guard.document().blacklist.is_empty());
    }
}
