//! In-memory request log and counters.
//!
//! Handlers hand a [`RequestLogEntry`] to an [`ObservabilitySink`] when a call
//! finishes. The built-in [`RequestLog`] keeps the most recent entries in a
//! bounded ring buffer plus total/success/error counters. Recording never blocks:
//! if the buffer lock is contended the entry is dropped and counted as such.
//! Counts are approximate under contention and nothing reads them to make a
//! routing decision.

use crate::core::metrics::get_metrics;
use crate::core::utils::truncate_text;
use chrono::Local;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const BODY_LOG_LIMIT: usize = 4000;
pub const REASONING_LOG_LIMIT: usize = 3000;
pub const CONTENT_LOG_LIMIT: usize = 1000;
pub const ERROR_LOG_LIMIT: usize = 2000;

/// Summary of one inbound request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestLogEntry {
    pub time: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub model: String,
    pub effective_model: String,
    pub request_id: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestLogEntry {
    pub fn new(path: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            method: "POST".to_string(),
            path: path.into(),
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    fn truncate(&mut self) {
        fn cut(field: &mut Option<String>, limit: usize) {
            if let Some(text) = field.as_mut() {
                *text = truncate_text(text, limit);
            }
        }
        cut(&mut self.body, BODY_LOG_LIMIT);
        cut(&mut self.reasoning, REASONING_LOG_LIMIT);
        cut(&mut self.content, CONTENT_LOG_LIMIT);
        cut(&mut self.error, ERROR_LOG_LIMIT);
    }
}

/// Fire-and-forget receiver of request summaries.
pub trait ObservabilitySink: Send + Sync {
    fn record(&self, entry: RequestLogEntry);
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub dropped: u64,
}

/// Bounded ring buffer of recent requests.
pub struct RequestLog {
    capacity: usize,
    entries: Mutex<VecDeque<RequestLogEntry>>,
    total: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
    dropped: AtomicU64,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            error: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Most recent entries, newest first.
    pub fn recent(&self) -> Vec<RequestLogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().rev().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().rev().cloned().collect(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl ObservabilitySink for RequestLog {
    fn record(&self, mut entry: RequestLogEntry) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if entry.is_success() {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error.fetch_add(1, Ordering::Relaxed);
        }

        let metrics = get_metrics();
        metrics
            .request_count
            .with_label_values(&[
                entry.path.as_str(),
                entry.model.as_str(),
                &entry.status.to_string(),
            ])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[entry.path.as_str(), entry.model.as_str()])
            .observe(entry.latency_ms as f64 / 1000.0);

        entry.truncate();
        match self.entries.try_lock() {
            Ok(mut entries) => {
                if entries.len() >= self.capacity {
                    entries.pop_front();
                }
                entries.push_back(entry);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: u16, id: &str) -> RequestLogEntry {
        RequestLogEntry {
            status,
            model: "glm-4.7".into(),
            ..RequestLogEntry::new("/v1/chat/completions", id)
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let log = RequestLog::new(2);
        log.record(entry(200, "req_1"));
        log.record(entry(200, "req_2"));
        log.record(entry(502, "req_3"));

        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "req_3");
        assert_eq!(recent[1].request_id, "req_2");

        assert_eq!(
            log.stats(),
            RequestStats {
                total: 3,
                success: 2,
                error: 1,
                dropped: 0
            }
        );
    }

    #[test]
    fn test_fields_are_truncated() {
        let log = RequestLog::new(4);
        let mut e = entry(200, "req_t");
        e.content = Some("x".repeat(CONTENT_LOG_LIMIT + 50));
        e.error = Some("short".into());
        log.record(e);

        let stored = &log.recent()[0];
        assert!(stored.content.as_ref().unwrap().ends_with("...(truncated)"));
        assert_eq!(stored.error.as_deref(), Some("short"));
    }

    #[test]
    fn test_clear() {
        let log = RequestLog::new(4);
        log.record(entry(200, "req_c"));
        log.clear();
        assert!(log.recent().is_empty());
        assert_eq!(log.stats().total, 1);
    }

    #[test]
    fn test_concurrent_recording_never_exceeds_capacity() {
        let log = std::sync::Arc::new(RequestLog::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        log.record(entry(200, &format!("req_{}_{}", t, i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = log.stats();
        assert_eq!(stats.total, 400);
        assert!(log.recent().len() <= 16);
    }
}
