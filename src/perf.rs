//! Per-retrieval performance accounting.
//!
//! One [`PerfRecord`] per retrieval key, overwritten on every retrieval and
//! never merged across retrievals. The record is shared between the
//! dispatcher (which owns the table and renders reports) and the worker
//! (which brackets each fetch), so it lives behind an `Arc<Mutex<..>>` scoped
//! to the retrieval key's lifetime.

use crate::key::RetrievalKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Timing and size data for the last retrieval of one key.
#[derive(Debug, Default)]
pub struct PerfRecord {
    /// URL of the last request.
    pub url: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    /// Compressed payload size of the last response.
    pub response_bytes: usize,
    /// Window-filtered points delivered by the last retrieval.
    pub point_count: usize,
    /// Error text of the last retrieval, empty on success.
    pub last_error: String,
    pub in_progress: bool,
    started_instant: Option<Instant>,
}

impl PerfRecord {
    /// Start a new measurement, clearing the previous retrieval's results.
    pub fn begin(&mut self, url: &str) {
        self.url = url.to_string();
        self.started_at = Some(Utc::now());
        self.started_instant = Some(Instant::now());
        self.finished_at = None;
        self.duration = None;
        self.response_bytes = 0;
        self.point_count = 0;
        self.last_error.clear();
        self.in_progress = true;
    }

    /// Complete the measurement.
    pub fn finish(&mut self, response_bytes: usize, point_count: usize, error: Option<&str>) {
        self.finished_at = Some(Utc::now());
        self.duration = self.started_instant.take().map(|t| t.elapsed());
        self.response_bytes = response_bytes;
        self.point_count = point_count;
        self.last_error = error.unwrap_or_default().to_string();
        self.in_progress = false;
    }

    /// Render the human-readable diagnostic block for this record.
    pub fn generate_report(&self) -> String {
        let mut report = String::from("Performance data for last request to this channel:\n");
        report.push_str(&format!("  url: {}\n", self.url));
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                report.push_str(&format!(
                    "  started: {}\n  finished: {}\n",
                    start.to_rfc3339(),
                    end.to_rfc3339()
                ));
            }
            (Some(start), None) => {
                report.push_str(&format!(
                    "  started: {} (still in progress)\n",
                    start.to_rfc3339()
                ));
            }
            _ => report.push_str("  no request issued yet\n"),
        }
        if let Some(duration) = self.duration {
            report.push_str(&format!("  duration: {} ms\n", duration.as_millis()));
        }
        report.push_str(&format!(
            "  response size: {} bytes, points in window: {}\n",
            self.response_bytes, self.point_count
        ));
        if self.last_error.is_empty() {
            report.push_str("  last error: none\n");
        } else {
            report.push_str(&format!("  last error: {}\n", self.last_error));
        }
        report
    }
}

/// Shared handle to one key's performance record.
pub type SharedPerfRecord = Arc<Mutex<PerfRecord>>;

/// Table of performance records, keyed by retrieval key.
#[derive(Default)]
pub struct PerformanceTracker {
    records: DashMap<RetrievalKey, SharedPerfRecord>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the record for a key, creating it if absent.
    pub fn ensure(&self, key: &RetrievalKey) -> SharedPerfRecord {
        self.records
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PerfRecord::default())))
            .clone()
    }

    pub fn get(&self, key: &RetrievalKey) -> Option<SharedPerfRecord> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    /// Drop the record when its channel is cleared.
    pub fn remove(&self, key: &RetrievalKey) {
        self.records.remove(key);
    }

    pub fn generate_report(&self, key: &RetrievalKey) -> Option<String> {
        self.get(key)
            .map(|record| record.lock().expect("perf record lock poisoned").generate_report())
    }
}
