use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;

const WINDOW_SIZE: usize = 30;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Bounded ring of latency samples, reporting min/avg/max like the
/// teacher's rate-limit snapshots do for request weights.
struct LatencyWindow {
    samples: VecDeque<f64>,
}

impl LatencyWindow {
    fn new() -> Self {
        LatencyWindow {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    fn push(&mut self, sample_ms: f64) {
        if self.samples.len() == WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    fn summary(&self) -> LatencyWindowSummary {
        if self.samples.is_empty() {
            return LatencyWindowSummary {
                min: 0.0,
                avg: 0.0,
                max: 0.0,
                count: 0,
                samples: vec![],
            };
        }
        let count = self.samples.len();
        let sum: f64 = self.samples.iter().sum();
        let min = self.samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = self.samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        LatencyWindowSummary {
            min,
            avg: sum / count as f64,
            max,
            count,
            samples: self.samples.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LatencyWindowSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub count: usize,
    pub samples: Vec<f64>,
}

#[derive(Debug, Serialize)]
pub struct TelemetryMetrics {
    pub rest_polling: LatencyWindowSummary,
    pub ws_messages: LatencyWindowSummary,
    pub stats_fetch: LatencyWindowSummary,
    pub rest_request_count: u64,
    pub ws_message_count: u64,
    pub ws_connected: bool,
    pub last_rest_update_age_ms: Option<f64>,
    pub last_ws_update_age_ms: Option<f64>,
    pub last_stats_update_age_ms: Option<f64>,
    pub ws_connection_uptime_secs: Option<f64>,
    pub active_accounts: u64,
    pub total_accounts: u64,
    pub connected_clients: u64,
}

/// Rolling health and latency telemetry for the whole process, mirroring
/// the original `LatencyTracker` singleton's surface.
pub struct Telemetry {
    rest_polling: RwLock<LatencyWindow>,
    ws_messages: RwLock<LatencyWindow>,
    stats_fetch: RwLock<LatencyWindow>,

    rest_request_count: AtomicU64,
    ws_message_count: AtomicU64,

    ws_connected: AtomicBool,
    ws_connection_start_bits: AtomicU64,

    last_rest_update_bits: AtomicU64,
    last_ws_update_bits: AtomicU64,
    last_stats_update_bits: AtomicU64,

    active_accounts: AtomicU64,
    total_accounts: AtomicU64,
    connected_clients: AtomicU64,
}

fn store_now(cell: &AtomicU64) {
    cell.store(now_secs().to_bits(), Ordering::Relaxed);
}

fn load_ts(cell: &AtomicU64) -> Option<f64> {
    let bits = cell.load(Ordering::Relaxed);
    if bits == 0 {
        None
    } else {
        Some(f64::from_bits(bits))
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry {
            rest_polling: RwLock::new(LatencyWindow::new()),
            ws_messages: RwLock::new(LatencyWindow::new()),
            stats_fetch: RwLock::new(LatencyWindow::new()),
            rest_request_count: AtomicU64::new(0),
            ws_message_count: AtomicU64::new(0),
            ws_connected: AtomicBool::new(false),
            ws_connection_start_bits: AtomicU64::new(0),
            last_rest_update_bits: AtomicU64::new(0),
            last_ws_update_bits: AtomicU64::new(0),
            last_stats_update_bits: AtomicU64::new(0),
            active_accounts: AtomicU64::new(0),
            total_accounts: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
        }
    }

    pub fn record_rest_poll(&self, latency_ms: f64) {
        self.rest_polling.write().push(latency_ms);
        self.rest_request_count.fetch_add(1, Ordering::Relaxed);
        store_now(&self.last_rest_update_bits);
    }

    pub fn record_ws_message(&self, latency_ms: Option<f64>) {
        if let Some(ms) = latency_ms {
            self.ws_messages.write().push(ms);
        }
        self.ws_message_count.fetch_add(1, Ordering::Relaxed);
        store_now(&self.last_ws_update_bits);
    }

    pub fn record_stats_fetch(&self, latency_ms: f64) {
        self.stats_fetch.write().push(latency_ms);
        store_now(&self.last_stats_update_bits);
    }

    pub fn set_ws_connected(&self, connected: bool) {
        let was_connected = self.ws_connected.swap(connected, Ordering::Relaxed);
        if connected && !was_connected {
            store_now(&self.ws_connection_start_bits);
        }
    }

    pub fn set_account_stats(&self, active: u64, total: u64, clients: u64) {
        self.active_accounts.store(active, Ordering::Relaxed);
        self.total_accounts.store(total, Ordering::Relaxed);
        self.connected_clients.store(clients, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> TelemetryMetrics {
        let now = now_secs();
        let age_ms = |ts: Option<f64>| ts.map(|t| (now - t) * 1000.0);
        let connection_uptime = if self.ws_connected.load(Ordering::Relaxed) {
            load_ts(&self.ws_connection_start_bits).map(|t| now - t)
        } else {
            None
        };
        TelemetryMetrics {
            rest_polling: self.rest_polling.read().summary(),
            ws_messages: self.ws_messages.read().summary(),
            stats_fetch: self.stats_fetch.read().summary(),
            rest_request_count: self.rest_request_count.load(Ordering::Relaxed),
            ws_message_count: self.ws_message_count.load(Ordering::Relaxed),
            ws_connected: self.ws_connected.load(Ordering::Relaxed),
            last_rest_update_age_ms: age_ms(load_ts(&self.last_rest_update_bits)),
            last_ws_update_age_ms: age_ms(load_ts(&self.last_ws_update_bits)),
            last_stats_update_age_ms: age_ms(load_ts(&self.last_stats_update_bits)),
            ws_connection_uptime_secs: connection_uptime,
            active_accounts: self.active_accounts.load(Ordering::Relaxed),
            total_accounts: self.total_accounts.load(Ordering::Relaxed),
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_poll_updates_window_and_counter() {
        let t = Telemetry::new();
        t.record_rest_poll(12.0);
        t.record_rest_poll(8.0);
        let m = t.metrics();
        assert_eq!(m.rest_request_count, 2);
        assert_eq!(m.rest_polling.count, 2);
        assert!((m.rest_polling.avg - 10.0).abs() < 1e-9);
    }

    #[test]
    fn window_caps_at_30_samples() {
        let t = Telemetry::new();
        for i in 0..40 {
            t.record_rest_poll(i as f64);
        }
        assert_eq!(t.metrics().rest_polling.count, WINDOW_SIZE);
    }

    #[test]
    fn ws_connected_transition_sets_connection_start() {
        let t = Telemetry::new();
        assert!(t.metrics().ws_connection_uptime_secs.is_none());
        t.set_ws_connected(true);
        assert!(t.metrics().ws_connection_uptime_secs.is_some());
        t.set_ws_connected(false);
        assert!(t.metrics().ws_connection_uptime_secs.is_none());
    }

    #[test]
    fn account_stats_round_trip() {
        let t = Telemetry::new();
        t.set_account_stats(2, 5, 3);
        let m = t.metrics();
        assert_eq!(m.active_accounts, 2);
        assert_eq!(m.total_accounts, 5);
        assert_eq!(m.connected_clients, 3);
    }
}
