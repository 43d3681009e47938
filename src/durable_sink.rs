// =============================================================================
// Optional best-effort write-through persistence
// =============================================================================
//
// Mirrors a PostgREST-style table API (account_snapshots / positions /
// orders / trades). Absence of credentials disables persistence silently;
// every failure is logged and swallowed — it must never affect cache
// correctness or block a connector.
// =============================================================================

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tracing::{debug, warn};

#[async_trait]
pub trait DurableSink: Send + Sync {
    async fn save_account_snapshot(&self, account_id: i64, snapshot: &Value);
    async fn save_positions(&self, account_id: i64, positions: &[Value]);
    async fn save_orders(&self, account_id: i64, orders: &[Value]);
    async fn save_trade(&self, account_id: i64, trade: &Value);
}

/// Used when no credentials are configured; every call is a silent no-op,
/// exactly like `is_initialized == false` on the original client.
pub struct NoopSink;

#[async_trait]
impl DurableSink for NoopSink {
    async fn save_account_snapshot(&self, _account_id: i64, _snapshot: &Value) {}
    async fn save_positions(&self, _account_id: i64, _positions: &[Value]) {}
    async fn save_orders(&self, _account_id: i64, _orders: &[Value]) {}
    async fn save_trade(&self, _account_id: i64, _trade: &Value) {}
}

pub struct PostgrestSink {
    base_url: String,
    client: reqwest::Client,
}

impl PostgrestSink {
    pub fn new(base_url: impl Into<String>, service_role_key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {service_role_key}"))?,
        );
        headers.insert("apikey", HeaderValue::from_str(service_role_key)?);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(PostgrestSink {
            base_url: base_url.into(),
            client,
        })
    }

    /// Loads from `SUPABASE_URL`/`SUPABASE_SERVICE_ROLE`; returns `None`
    /// when either is absent, matching the original's silent-disable gate.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SUPABASE_URL").ok()?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE").ok()?;
        match PostgrestSink::new(url, &key) {
            Ok(sink) => {
                debug!("durable sink initialized");
                Some(sink)
            }
            Err(e) => {
                warn!(error = %e, "failed to initialize durable sink, persistence disabled");
                None
            }
        }
    }

    async fn insert(&self, table: &str, rows: &Value) {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        if let Err(e) = self.client.post(&url).json(rows).send().await {
            warn!(table, error = %e, "durable sink insert failed");
        }
    }
}

#[async_trait]
impl DurableSink for PostgrestSink {
    async fn save_account_snapshot(&self, account_id: i64, snapshot: &Value) {
        let row = serde_json::json!({"account_index": account_id, "raw_data": snapshot});
        self.insert("account_snapshots", &row).await;
    }

    async fn save_positions(&self, account_id: i64, positions: &[Value]) {
        if positions.is_empty() {
            return;
        }
        let rows: Vec<Value> = positions
            .iter()
            .map(|p| serde_json::json!({"account_index": account_id, "raw_data": p}))
            .collect();
        self.insert("positions", &Value::Array(rows)).await;
    }

    async fn save_orders(&self, account_id: i64, orders: &[Value]) {
        if orders.is_empty() {
            return;
        }
        let rows: Vec<Value> = orders
            .iter()
            .map(|o| serde_json::json!({"account_index": account_id, "raw_data": o}))
            .collect();
        self.insert("orders", &Value::Array(rows)).await;
    }

    async fn save_trade(&self, account_id: i64, trade: &Value) {
        let row = serde_json::json!({"account_index": account_id, "raw_data": trade});
        self.insert("trades", &row).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_sink_accepts_everything_without_panicking() {
        let sink = NoopSink;
        sink.save_account_snapshot(1, &Value::Null).await;
        sink.save_positions(1, &[]).await;
        sink.save_orders(1, &[]).await;
        sink.save_trade(1, &Value::Null).await;
    }

    #[test]
    fn from_env_is_none_without_credentials() {
        std::env::remove_var("SUPABASE_URL");
        std::env::remove_var("SUPABASE_SERVICE_ROLE");
        assert!(PostgrestSink::from_env().is_none());
    }
}
