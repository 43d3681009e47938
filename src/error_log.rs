use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{ErrorKind, ErrorSource};

const MAX_RECENT_ERRORS: usize = 100;
const MAX_MESSAGE_LEN: usize = 200;
const RECENT_WINDOW_SECS: f64 = 60.0;
const SUMMARY_WINDOW_SECS: f64 = 300.0;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorEntry {
    pub ts: f64,
    pub account_id: i64,
    pub account_name: String,
    pub kind: String,
    pub code: Option<String>,
    pub message: String,
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub last_60s: usize,
    pub last_300s: usize,
    pub by_account_300s: HashMap<String, usize>,
    pub by_kind_300s: HashMap<String, usize>,
    pub counts_by_kind: HashMap<String, u64>,
    pub uptime_secs: f64,
}

/// Bounded ring of recent errors plus running per-kind counters, grounded
/// on the original `ErrorCollector`.
pub struct ErrorLog {
    started_at: f64,
    entries: Mutex<VecDeque<ErrorEntry>>,
    counts: Mutex<HashMap<String, u64>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        ErrorLog {
            started_at: now_secs(),
            entries: Mutex::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(
        &self,
        account_id: i64,
        account_name: &str,
        kind: ErrorKind,
        code: Option<String>,
        message: &str,
        source: ErrorSource,
    ) {
        let truncated: String = message.chars().take(MAX_MESSAGE_LEN).collect();
        let entry = ErrorEntry {
            ts: now_secs(),
            account_id,
            account_name: account_name.to_string(),
            kind: kind.to_string(),
            code,
            message: truncated,
            source: source.to_string(),
        };

        let counter_key = format!("{}:{}", entry.source, entry.kind);
        *self.counts.lock().entry(counter_key).or_insert(0) += 1;

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > MAX_RECENT_ERRORS {
            entries.pop_front();
        }
    }

    /// Newest first, optionally filtered by source.
    pub fn recent(&self, limit: usize, source: Option<ErrorSource>) -> Vec<ErrorEntry> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .filter(|e| match source {
                Some(s) => e.source == s.to_string(),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> ErrorSummary {
        let now = now_secs();
        let entries = self.entries.lock();
        let last_60s = entries.iter().filter(|e| now - e.ts <= RECENT_WINDOW_SECS).count();

        let mut by_account_300s: HashMap<String, usize> = HashMap::new();
        let mut by_kind_300s: HashMap<String, usize> = HashMap::new();
        let mut last_300s = 0usize;
        for e in entries.iter().filter(|e| now - e.ts <= SUMMARY_WINDOW_SECS) {
            last_300s += 1;
            *by_account_300s.entry(e.account_name.clone()).or_insert(0) += 1;
            *by_kind_300s.entry(e.kind.clone()).or_insert(0) += 1;
        }

        ErrorSummary {
            total: entries.len(),
            last_60s,
            last_300s,
            by_account_300s,
            by_kind_300s,
            counts_by_kind: self.counts.lock().clone(),
            uptime_secs: now - self.started_at,
        }
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_recent_orders_newest_first() {
        let log = ErrorLog::new();
        log.add(1, "acct-1", ErrorKind::Timeout, None, "first", ErrorSource::Rest);
        log.add(1, "acct-1", ErrorKind::Connection, None, "second", ErrorSource::WebSocket);
        let recent = log.recent(10, None);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].message, "first");
    }

    #[test]
    fn recent_filters_by_source() {
        let log = ErrorLog::new();
        log.add(1, "acct-1", ErrorKind::Timeout, None, "r", ErrorSource::Rest);
        log.add(1, "acct-1", ErrorKind::Connection, None, "w", ErrorSource::WebSocket);
        let rest_only = log.recent(10, Some(ErrorSource::Rest));
        assert_eq!(rest_only.len(), 1);
        assert_eq!(rest_only[0].message, "r");
    }

    #[test]
    fn message_is_truncated_to_200_chars() {
        let log = ErrorLog::new();
        let long = "x".repeat(500);
        log.add(1, "acct-1", ErrorKind::Exception, None, &long, ErrorSource::Rest);
        assert_eq!(log.recent(1, None)[0].message.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn ring_is_bounded_at_100() {
        let log = ErrorLog::new();
        for i in 0..150 {
            log.add(1, "acct-1", ErrorKind::Exception, None, &format!("e{i}"), ErrorSource::Rest);
        }
        assert_eq!(log.summary().total, MAX_RECENT_ERRORS);
        // Oldest entries evicted: the newest retained should be the last one added.
        assert_eq!(log.recent(1, None)[0].message, "e149");
    }

    #[test]
    fn summary_counts_by_kind_and_account() {
        let log = ErrorLog::new();
        log.add(1, "acct-1", ErrorKind::Http(429), None, "rate limited", ErrorSource::Rest);
        log.add(2, "acct-2", ErrorKind::Http(429), None, "rate limited", ErrorSource::Rest);
        let summary = log.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_kind_300s.get("HTTP_429"), Some(&2));
        assert_eq!(summary.by_account_300s.get("acct-1"), Some(&1));
        assert_eq!(summary.counts_by_kind.get("rest:HTTP_429"), Some(&2));
    }
}
