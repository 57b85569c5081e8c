use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Ingestion accounting, surfaced read-only through the ingestion:// resources.
// Counters live behind per-field locks and atomics; readers get a consistent
// snapshot at whatever moment they look.
// ---------------------------------------------------------------------------

/// Most recent failures kept for `ingestion://failures`; oldest drop first.
pub const FAILURE_RING_CAPACITY: usize = 20;

/// Distinct source paths tracked before per-source accounting saturates.
pub const MAX_SOURCES_TRACKED: usize = 100;

#[derive(Debug, Default)]
struct SourceStats {
    matched: u64,
    processed: u64,
    segments: u64,
    errors: u64,
    captures: BTreeMap<String, BTreeSet<String>>,
    watching: bool,
    watch_events: u64,
    watch_updates: u64,
    watch_removes: u64,
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub file_path: String,
    pub error_type: String,
    pub message: String,
    pub source_path: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct IngestionStats {
    total_errors: AtomicU64,
    last_ingestion: Mutex<Option<DateTime<Utc>>>,
    sources: Mutex<BTreeMap<String, SourceStats>>,
    overflow_logged: AtomicBool,
    failures: Mutex<VecDeque<FailureRecord>>,
}

impl IngestionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_source<F: FnOnce(&mut SourceStats)>(&self, source_path: &str, f: F) {
        let mut sources = self.sources.lock().expect("stats poisoned");
        if !sources.contains_key(source_path) && sources.len() >= MAX_SOURCES_TRACKED {
            if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    limit = MAX_SOURCES_TRACKED,
                    "per-source stats saturated; further sources are untracked"
                );
            }
            return;
        }
        f(sources.entry(source_path.to_string()).or_default());
    }

    pub fn record_matched(&self, source_path: &str) {
        self.with_source(source_path, |s| s.matched += 1);
    }

    pub fn record_processed(&self, source_path: &str, segment_count: usize) {
        self.with_source(source_path, |s| {
            s.processed += 1;
            s.segments += segment_count as u64;
        });
    }

    pub fn record_captures(&self, source_path: &str, captures: &BTreeMap<String, String>) {
        if captures.is_empty() {
            return;
        }
        self.with_source(source_path, |s| {
            for (name, value) in captures {
                s.captures
                    .entry(name.clone())
                    .or_default()
                    .insert(value.clone());
            }
        });
    }

    pub fn record_failure(
        &self,
        source_path: &str,
        file_path: &str,
        error_type: &str,
        message: &str,
    ) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.with_source(source_path, |s| s.errors += 1);

        let mut failures = self.failures.lock().expect("stats poisoned");
        if failures.len() >= FAILURE_RING_CAPACITY {
            failures.pop_front();
        }
        failures.push_back(FailureRecord {
            file_path: file_path.to_string(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            source_path: source_path.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn mark_ingestion_complete(&self) {
        *self.last_ingestion.lock().expect("stats poisoned") = Some(Utc::now());
    }

    pub fn set_watching(&self, source_path: &str, watching: bool) {
        self.with_source(source_path, |s| s.watching = watching);
    }

    pub fn record_watch_event(&self, source_path: &str) {
        self.with_source(source_path, |s| s.watch_events += 1);
    }

    pub fn record_watch_update(&self, source_path: &str) {
        self.with_source(source_path, |s| s.watch_updates += 1);
    }

    pub fn record_watch_remove(&self, source_path: &str) {
        self.with_source(source_path, |s| s.watch_removes += 1);
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    // ── Resource documents ──────────────────────────────────────────────

    /// `ingestion://status`. Document and segment counts come from the live
    /// store so deletions are reflected.
    pub fn status_json(&self, total_documents: usize, total_segments: usize) -> serde_json::Value {
        let last = self
            .last_ingestion
            .lock()
            .expect("stats poisoned")
            .map(|t| t.to_rfc3339());
        json!({
            "total_documents": total_documents,
            "total_segments": total_segments,
            "total_errors": self.total_errors(),
            "last_ingestion_at": last,
        })
    }

    /// `ingestion://stats`.
    pub fn stats_json(&self) -> serde_json::Value {
        let sources = self.sources.lock().expect("stats poisoned");
        let entries: Vec<_> = sources
            .iter()
            .map(|(path, s)| {
                json!({
                    "path": path,
                    "files_matched": s.matched,
                    "files_processed": s.processed,
                    "segments_created": s.segments,
                    "errors": s.errors,
                })
            })
            .collect();
        json!({ "sources": entries })
    }

    /// `ingestion://failures`.
    pub fn failures_json(&self) -> serde_json::Value {
        let failures = self.failures.lock().expect("stats poisoned");
        let entries: Vec<_> = failures
            .iter()
            .map(|f| {
                json!({
                    "file_path": f.file_path,
                    "error_type": f.error_type,
                    "message": f.message,
                    "source_path": f.source_path,
                    "timestamp": f.timestamp.to_rfc3339(),
                })
            })
            .collect();
        json!(entries)
    }

    /// `ingestion://metadata` — capture values seen per source path.
    pub fn metadata_json(&self) -> serde_json::Value {
        let sources = self.sources.lock().expect("stats poisoned");
        let entries: Vec<_> = sources
            .iter()
            .map(|(path, s)| {
                let captures: BTreeMap<&String, Vec<&String>> = s
                    .captures
                    .iter()
                    .map(|(name, values)| (name, values.iter().collect()))
                    .collect();
                json!({ "path": path, "captures": captures })
            })
            .collect();
        json!({ "path_specs": entries })
    }

    /// `ingestion://watch-stats`.
    pub fn watch_json(&self) -> serde_json::Value {
        let sources = self.sources.lock().expect("stats poisoned");
        let entries: Vec<_> = sources
            .iter()
            .map(|(path, s)| {
                json!({
                    "path": path,
                    "watching": s.watching,
                    "events_seen": s.watch_events,
                    "updates_applied": s.watch_updates,
                    "removes_applied": s.watch_removes,
                })
            })
            .collect();
        json!({ "sources": entries })
    }
}
