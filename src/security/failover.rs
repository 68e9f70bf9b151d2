//! Primary/fallback routing state.
//!
//! Each backend has a [`FailureRecord`] counting consecutive failures. Once
//! the count reaches `fallback_after_failures`, [`FailoverController::should_use_fallback`]
//! reports true. A single success resets the count to zero.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Fail-over configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverConfig {
    /// Master switch; when false `should_use_fallback` is always false
    pub enabled: bool,
    /// Consecutive failures before traffic moves to the fallback
    pub fallback_after_failures: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_after_failures: 3,
        }
    }
}

/// Consecutive-failure bookkeeping for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub backend_id: String,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

impl FailureRecord {
    fn new(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            consecutive_failures: 0,
            last_failure: None,
        }
    }
}

/// Tracks failure records for every backend the gateway talks to.
///
/// The outer map lock only guards insertion of new backends; increments and
/// resets of one backend serialize on that backend's own mutex.
pub struct FailoverController {
    records: RwLock<HashMap<String, Arc<Mutex<FailureRecord>>>>,
    config: FailoverConfig,
}

impl FailoverController {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> FailoverConfig {
        self.config
    }

    fn record(&self, backend_id: &str) -> Arc<Mutex<FailureRecord>> {
        if let Some(record) = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(backend_id)
        {
            return Arc::clone(record);
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            records
                .entry(backend_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(FailureRecord::new(backend_id)))),
        )
    }

    /// Count one failure against `backend_id`. Returns the new streak length.
    pub fn record_failure(&self, backend_id: &str) -> u32 {
        let record = self.record(backend_id);
        let mut record = record.lock().unwrap_or_else(|e| e.into_inner());
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_failure = Some(Instant::now());

        let count = record.consecutive_failures;
        metrics::counter!("bridgeway_backend_failures_total", "backend" => backend_id.to_string())
            .increment(1);
        if self.config.enabled && count == self.config.fallback_after_failures {
            tracing::warn!(
                "Backend '{}' reached {} consecutive failures, preferring fallback",
                backend_id,
                count
            );
        }
        count
    }

    /// Reset `backend_id` to zero failures.
    pub fn record_success(&self, backend_id: &str) {
        let record = self.record(backend_id);
        let mut record = record.lock().unwrap_or_else(|e| e.into_inner());
        if record.consecutive_failures > 0 {
            tracing::info!(
                "Backend '{}' recovered after {} consecutive failures",
                backend_id,
                record.consecutive_failures
            );
        }
        record.consecutive_failures = 0;
    }

    /// Whether requests for `backend_id` should go to the fallback. Pure read.
    pub fn should_use_fallback(&self, backend_id: &str) -> bool {
        self.config.enabled && self.failure_count(backend_id) >= self.config.fallback_after_failures
    }

    pub fn failure_count(&self, backend_id: &str) -> u32 {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(backend_id)
            .map(|r| r.lock().unwrap_or_else(|e| e.into_inner()).consecutive_failures)
            .unwrap_or(0)
    }

    /// All known records, sorted by backend id.
    pub fn snapshot(&self) -> Vec<FailureRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<FailureRecord> = records
            .values()
            .map(|r| r.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();
        out.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        out
    }
}

impl Default for FailoverController {
    fn default() -> Self {
        Self::new(FailoverConfig::default())
    }
}
