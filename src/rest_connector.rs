// =============================================================================
// Per-account REST connector — signed polling with two-phase backoff
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::auth::AuthMinter;
use crate::cache::Cache;
use crate::durable_sink::DurableSink;
use crate::error_log::ErrorLog;
use crate::telemetry::Telemetry;
use crate::types::{AccountConfig, AccountSnapshot, ErrorKind, ErrorSource, RetryState};

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Extracts the positions list from a raw account-snapshot payload, which
/// shapes positions as `{"accounts": [{"positions": [...]}]}`.
fn extract_positions(raw: &Value) -> Vec<Value> {
    raw.get("accounts")
        .and_then(|a| a.as_array())
        .and_then(|accounts| accounts.first())
        .and_then(|account| account.get("positions"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Distinct market ids an account currently holds a position in, used to
/// fan out per-market active-order fetches.
pub(crate) fn position_market_ids(raw: &Value) -> Vec<i64> {
    let mut markets: Vec<i64> = extract_positions(raw)
        .iter()
        .filter_map(|p| p.get("market_id").and_then(|m| m.as_i64()))
        .collect();
    markets.sort_unstable();
    markets.dedup();
    markets
}

fn classify_reqwest_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if let Some(status) = err.status() {
        ErrorKind::Http(status.as_u16())
    } else if err.is_connect() {
        ErrorKind::Connection
    } else {
        ErrorKind::Exception
    }
}

/// Per-account HTTP session plus signing and retry bookkeeping. One
/// instance per account, built once and reused across every poll, mirroring
/// the teacher's `BinanceClient` lifecycle.
pub struct RestConnector {
    account: AccountConfig,
    base_url: String,
    client: reqwest::Client,
    minter: AuthMinter,
    state: RwLock<RetryState>,
    active_orders: Mutex<Vec<Value>>,
    last_durable_write: Mutex<Option<f64>>,
    cache: Arc<Cache>,
    telemetry: Arc<Telemetry>,
    errors: Arc<ErrorLog>,
    sink: Arc<dyn DurableSink>,
}

impl RestConnector {
    pub fn new(
        account: AccountConfig,
        base_url: String,
        cache: Arc<Cache>,
        telemetry: Arc<Telemetry>,
        errors: Arc<ErrorLog>,
        sink: Arc<dyn DurableSink>,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_static("feed-aggregator/1.0"));

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30));

        if let Some(proxy_url) = &account.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        let client = builder.build()?;
        let minter = AuthMinter::new(&account);

        Ok(RestConnector {
            account,
            base_url,
            client,
            minter,
            state: RwLock::new(RetryState::default()),
            active_orders: Mutex::new(Vec::new()),
            last_durable_write: Mutex::new(None),
            cache,
            telemetry,
            errors,
            sink,
        })
    }

    pub fn should_skip(&self) -> bool {
        self.state.read().should_skip(now_secs())
    }

    fn record_failure(&self, kind: ErrorKind, message: &str) {
        let mut state = self.state.write();
        state.record_failure(now_secs());
        drop(state);
        self.errors.add(
            self.account.account_id,
            &self.account.account_name,
            kind,
            None,
            message,
            ErrorSource::Rest,
        );
    }

    fn record_success(&self) {
        self.state.write().record_success(now_secs());
    }

    fn signed_request(&self, path: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let token = self.minter.mint()?;
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", token.value))
    }

    /// Polls the account's full state snapshot and writes it into the
    /// cache. Skips entirely (no network call) while in backoff.
    #[instrument(skip(self), fields(account_id = self.account.account_id))]
    pub async fn poll_once(&self) {
        if self.should_skip() {
            debug!("skipping poll, in backoff");
            return;
        }

        let started = Instant::now();
        let path = format!("/api/v1/account?by=index&value={}", self.account.account_id);

        let request = match self.signed_request(&path) {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(ErrorKind::Exception, &e.to_string());
                return;
            }
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.telemetry.record_rest_poll(latency_ms);

                match response.json::<Value>().await {
                    Ok(raw) => {
                        self.record_success();
                        let active_orders = self.active_orders.lock().clone();
                        let snapshot = AccountSnapshot {
                            account_id: self.account.account_id,
                            account_name: self.account.account_name.clone(),
                            raw,
                            active_orders,
                            last_update: now_secs(),
                        };
                        let key = format!("account:{}", self.account.account_id);
                        self.cache.set(key, serde_json::to_value(&snapshot).unwrap(), None);
                        self.maybe_write_through(&snapshot).await;
                    }
                    Err(e) => self.record_failure(ErrorKind::Exception, &e.to_string()),
                }
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let kind = if status == 429 {
                    ErrorKind::Http(429)
                } else {
                    ErrorKind::Http(status)
                };
                self.record_failure(kind, &format!("HTTP {status}"));
            }
            Err(e) => {
                let kind = classify_reqwest_error(&e);
                self.record_failure(kind, &e.to_string());
            }
        }
    }

    async fn maybe_write_through(&self, snapshot: &AccountSnapshot) {
        let now = now_secs();
        let due = {
            let mut last = self.last_durable_write.lock();
            let due = last.map(|t| now - t >= 60.0).unwrap_or(true);
            if due {
                *last = Some(now);
            }
            due
        };
        if !due {
            return;
        }

        self.sink
            .save_account_snapshot(self.account.account_id, &snapshot.raw)
            .await;

        let positions = extract_positions(&snapshot.raw);
        if !positions.is_empty() {
            self.sink.save_positions(self.account.account_id, &positions).await;
        }

        if !snapshot.active_orders.is_empty() {
            self.sink
                .save_orders(self.account.account_id, &snapshot.active_orders)
                .await;
        }
    }

    /// Fetches active orders for one market, respecting the shared backoff.
    #[instrument(skip(self), fields(account_id = self.account.account_id, market_id))]
    pub async fn fetch_active_orders(&self, market_id: i64) -> Vec<Value> {
        if self.should_skip() {
            return self.active_orders.lock().clone();
        }

        let path = format!(
            "/api/v1/orders?by=index&value={}&market_id={market_id}",
            self.account.account_id
        );
        let request = match self.signed_request(&path) {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(ErrorKind::Exception, &e.to_string());
                return Vec::new();
            }
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => match response.json::<Vec<Value>>().await {
                Ok(orders) => {
                    self.record_success();
                    orders
                }
                Err(e) => {
                    self.record_failure(ErrorKind::Exception, &e.to_string());
                    Vec::new()
                }
            },
            Ok(response) => {
                let status = response.status().as_u16();
                self.record_failure(ErrorKind::Http(status), &format!("HTTP {status}"));
                Vec::new()
            }
            Err(e) => {
                let kind = classify_reqwest_error(&e);
                self.record_failure(kind, &e.to_string());
                Vec::new()
            }
        }
    }

    /// Fans out per-market order fetches in parallel and stores the
    /// concatenated, non-exception results as the account's current
    /// active-order list.
    pub async fn fetch_all_active_orders(&self, markets: &[i64]) {
        if markets.is_empty() {
            *self.active_orders.lock() = Vec::new();
            return;
        }

        let futures = markets.iter().map(|&m| self.fetch_active_orders(m));
        let results = futures_util::future::join_all(futures).await;
        let merged: Vec<Value> = results.into_iter().flatten().collect();
        *self.active_orders.lock() = merged;
    }

    pub fn force_reset(&self) {
        self.state.write().force_reset();
        warn!(account_id = self.account.account_id, "rest connector force-reset");
    }

    pub fn retry_state_snapshot(&self) -> RetryState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_sink::NoopSink;

    fn connector() -> RestConnector {
        let account = AccountConfig {
            account_id: 1,
            account_name: "a".into(),
            api_key_index: 0,
            private_key: "p".into(),
            public_key: "q".into(),
            proxy_url: None,
        };
        RestConnector::new(
            account,
            "https://example.invalid".into(),
            Arc::new(Cache::new()),
            Arc::new(Telemetry::new()),
            Arc::new(ErrorLog::new()),
            Arc::new(NoopSink),
        )
        .unwrap()
    }

    #[test]
    fn fresh_connector_does_not_skip() {
        let c = connector();
        assert!(!c.should_skip());
    }

    #[test]
    fn three_failures_trigger_backoff() {
        let c = connector();
        for _ in 0..3 {
            c.record_failure(ErrorKind::Http(429), "rate limited");
        }
        assert!(c.should_skip());
        let state = c.retry_state_snapshot();
        assert!(!state.connected);
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn five_phase1_failures_escalate_to_phase2() {
        let c = connector();
        for _ in 0..(3 + 5) {
            c.record_failure(ErrorKind::Connection, "down");
        }
        let state = c.retry_state_snapshot();
        assert_eq!(state.retry_phase, crate::types::RetryPhase::Phase2);
    }

    #[test]
    fn force_reset_clears_backoff() {
        let c = connector();
        for _ in 0..3 {
            c.record_failure(ErrorKind::Exception, "boom");
        }
        assert!(c.should_skip());
        c.force_reset();
        assert!(!c.should_skip());
    }

    #[tokio::test]
    async fn fetch_all_active_orders_with_no_markets_clears_list() {
        let c = connector();
        c.fetch_all_active_orders(&[]).await;
        assert!(c.active_orders.lock().is_empty());
    }

    #[test]
    fn position_market_ids_dedupes_and_sorts() {
        let raw = serde_json::json!({
            "accounts": [{
                "positions": [
                    {"market_id": 3}, {"market_id": 1}, {"market_id": 3}
                ]
            }]
        });
        assert_eq!(position_market_ids(&raw), vec![1, 3]);
    }

    #[test]
    fn position_market_ids_empty_without_accounts() {
        assert!(position_market_ids(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn extract_positions_reads_first_account() {
        let raw = serde_json::json!({"accounts": [{"positions": [{"market_id": 5}]}]});
        assert_eq!(extract_positions(&raw).len(), 1);
    }
}
