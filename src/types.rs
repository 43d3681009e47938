use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable account identity and credentials, loaded once at startup.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub account_id: i64,
    pub account_name: String,
    pub api_key_index: i64,
    pub private_key: String,
    pub public_key: String,
    pub proxy_url: Option<String>,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("account_id", &self.account_id)
            .field("account_name", &self.account_name)
            .field("api_key_index", &self.api_key_index)
            .field("private_key", &"<redacted>")
            .field("public_key", &"<redacted>")
            .field("proxy_url", &self.proxy_url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One TTL-bounded value in the cache.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub data: Value,
    pub inserted_at: f64,
    pub ttl_seconds: f64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: f64) -> bool {
        now - self.inserted_at > self.ttl_seconds
    }

    pub fn age(&self, now: f64) -> f64 {
        (now - self.inserted_at).max(0.0)
    }
}

/// Normalized view of a single account's REST snapshot, stored at
/// `account:<id>`.
#[derive(Clone, Debug, Serialize)]
pub struct AccountSnapshot {
    pub account_id: i64,
    pub account_name: String,
    pub raw: Value,
    pub active_orders: Vec<Value>,
    pub last_update: f64,
}

/// Discrete backoff regime a connector is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RetryPhase {
    Phase1,
    Phase2,
}

impl fmt::Display for RetryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPhase::Phase1 => write!(f, "phase1"),
            RetryPhase::Phase2 => write!(f, "phase2"),
        }
    }
}

pub const RETRY_PHASE_1_INTERVAL_SECS: f64 = 60.0;
pub const RETRY_PHASE_1_MAX_ATTEMPTS: u32 = 5;
pub const RETRY_PHASE_2_INTERVAL_SECS: f64 = 300.0;
pub const CONSECUTIVE_FAILURES_TO_DISCONNECT: u32 = 3;

/// Shared two-phase retry bookkeeping, reused identically by the REST and
/// WS connectors.
#[derive(Clone, Debug, Serialize)]
pub struct RetryState {
    pub connected: bool,
    pub last_success_ts: Option<f64>,
    pub last_failure_ts: Option<f64>,
    pub success_total: u64,
    pub failure_total: u64,
    pub consecutive_failures: u32,
    pub retry_phase: RetryPhase,
    pub phase_attempts: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        RetryState {
            connected: true,
            last_success_ts: None,
            last_failure_ts: None,
            success_total: 0,
            failure_total: 0,
            consecutive_failures: 0,
            retry_phase: RetryPhase::Phase1,
            phase_attempts: 0,
        }
    }
}

impl RetryState {
    pub fn retry_interval(&self) -> f64 {
        match self.retry_phase {
            RetryPhase::Phase1 => RETRY_PHASE_1_INTERVAL_SECS,
            RetryPhase::Phase2 => RETRY_PHASE_2_INTERVAL_SECS,
        }
    }

    pub fn should_skip(&self, now: f64) -> bool {
        if self.connected {
            return false;
        }
        match self.last_failure_ts {
            Some(t) => now - t < self.retry_interval(),
            None => false,
        }
    }

    pub fn record_success(&mut self, now: f64) {
        self.connected = true;
        self.last_success_ts = Some(now);
        self.success_total += 1;
        self.consecutive_failures = 0;
        self.retry_phase = RetryPhase::Phase1;
        self.phase_attempts = 0;
    }

    pub fn record_failure(&mut self, now: f64) {
        self.last_failure_ts = Some(now);
        self.failure_total += 1;
        self.consecutive_failures += 1;

        // The failure that first crosses the disconnect threshold is the
        // OK -> PHASE1 transition itself, not a phase attempt; only
        // failures while already disconnected count against the phase.
        let already_disconnected = !self.connected;
        if self.consecutive_failures >= CONSECUTIVE_FAILURES_TO_DISCONNECT {
            self.connected = false;
            if already_disconnected {
                match self.retry_phase {
                    RetryPhase::Phase1 => {
                        self.phase_attempts += 1;
                        if self.phase_attempts >= RETRY_PHASE_1_MAX_ATTEMPTS {
                            self.retry_phase = RetryPhase::Phase2;
                        }
                    }
                    RetryPhase::Phase2 => {
                        self.phase_attempts += 1;
                    }
                }
            }
        }
    }

    pub fn force_reset(&mut self) {
        *self = RetryState::default();
    }
}

/// Failure taxonomy shared by both connectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Http(u16),
    Connection,
    Exception,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Http(status) => write!(f, "HTTP_{status}"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Exception => write!(f, "exception"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorSource {
    Rest,
    WebSocket,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Rest => write!(f, "rest"),
            ErrorSource::WebSocket => write!(f, "websocket"),
        }
    }
}
