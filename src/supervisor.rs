// =============================================================================
// Supervisor — process lifecycle: spawn, wire, force-reconnect, shutdown
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::broadcast::BroadcastHub;
use crate::cache::Cache;
use crate::config::GlobalSettings;
use crate::durable_sink::DurableSink;
use crate::error_log::ErrorLog;
use crate::merge;
use crate::rest_connector::RestConnector;
use crate::telemetry::Telemetry;
use crate::types::AccountConfig;
use crate::ws_connector::WsConnector;

/// One account's running pair plus the tasks that drive them.
struct AccountHandle {
    rest: Arc<RestConnector>,
    ws: Arc<WsConnector>,
    poll_task: tokio::task::JoinHandle<()>,
    orders_task: tokio::task::JoinHandle<()>,
    ws_task: tokio::task::JoinHandle<()>,
}

/// Owns every per-account connector pair and the shared components they
/// write into. Built once at startup; `run` drives it until shutdown.
pub struct Supervisor {
    pub cache: Arc<Cache>,
    pub telemetry: Arc<Telemetry>,
    pub errors: Arc<ErrorLog>,
    pub hub: Arc<BroadcastHub>,
    settings: GlobalSettings,
    sink: Arc<dyn DurableSink>,
    accounts: parking_lot::Mutex<HashMap<i64, AccountHandle>>,
}

impl Supervisor {
    pub fn new(settings: GlobalSettings, sink: Arc<dyn DurableSink>) -> Self {
        Supervisor {
            cache: Arc::new(Cache::new()),
            telemetry: Arc::new(Telemetry::new()),
            errors: Arc::new(ErrorLog::new()),
            hub: Arc::new(BroadcastHub::new()),
            settings,
            sink,
            accounts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the REST poller, the per-market orders fetcher, and the WS
    /// connector for every configured account, wiring the merge layer as
    /// the WS connector's callback.
    pub fn start(self: &Arc<Self>, accounts: Vec<AccountConfig>) -> anyhow::Result<()> {
        self.telemetry.set_account_stats(0, accounts.len() as u64, 0);

        for account in accounts {
            let account_id = account.account_id;
            let rest = Arc::new(RestConnector::new(
                account.clone(),
                self.settings.lighter_base_url.clone(),
                self.cache.clone(),
                self.telemetry.clone(),
                self.errors.clone(),
                self.sink.clone(),
            )?);

            let ws = Arc::new(WsConnector::new(
                account,
                self.settings.lighter_ws_url.clone(),
                self.telemetry.clone(),
                self.errors.clone(),
            ));

            let poll_task = {
                let rest = rest.clone();
                let interval = self.settings.poll_interval;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(std::time::Duration::from_secs_f64(interval.max(0.05)));
                    loop {
                        ticker.tick().await;
                        rest.poll_once().await;
                    }
                })
            };

            let orders_task = {
                let rest = rest.clone();
                let cache = self.cache.clone();
                let interval = self.settings.poll_interval;
                let account_key = format!("account:{account_id}");
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(std::time::Duration::from_secs_f64(interval.max(0.05)));
                    loop {
                        ticker.tick().await;
                        let markets = cache
                            .get(&account_key)
                            .and_then(|snapshot| snapshot.get("raw").cloned())
                            .map(|raw| crate::rest_connector::position_market_ids(&raw))
                            .unwrap_or_default();
                        rest.fetch_all_active_orders(&markets).await;
                    }
                })
            };

            let ws_task = {
                let ws = ws.clone();
                let cache = self.cache.clone();
                let sink = self.sink.clone();
                let hub = self.hub.clone();
                tokio::spawn(async move {
                    let callback: crate::ws_connector::FrameCallback = Arc::new(move |acct_id, channel, frame| {
                        let cache = cache.clone();
                        let sink = sink.clone();
                        let hub = hub.clone();
                        let channel2 = channel.clone();
                        let frame2 = frame.clone();
                        hub.broadcast(&json!({"type": "lighter_update", "data": frame2}));
                        tokio::spawn(async move {
                            merge::route(&cache, sink.as_ref(), acct_id, &channel2, &frame).await;
                        });
                    });
                    ws.run(callback).await;
                })
            };

            self.accounts.lock().insert(
                account_id,
                AccountHandle {
                    rest,
                    ws,
                    poll_task,
                    orders_task,
                    ws_task,
                },
            );
        }

        info!(accounts = self.accounts.lock().len(), "supervisor started");
        Ok(())
    }

    pub fn force_reconnect(&self, account_id: Option<i64>) {
        let accounts = self.accounts.lock();
        match account_id {
            Some(id) => {
                if let Some(handle) = accounts.get(&id) {
                    handle.rest.force_reset();
                    handle.ws.force_reset();
                    warn!(account_id = id, "forced reconnect");
                }
            }
            None => {
                for (id, handle) in accounts.iter() {
                    handle.rest.force_reset();
                    handle.ws.force_reset();
                    warn!(account_id = id, "forced reconnect (all)");
                }
            }
        }
    }

    pub fn health_snapshot(&self) -> Value {
        let accounts = self.accounts.lock();
        let mut per_account = serde_json::Map::new();
        for (id, handle) in accounts.iter() {
            per_account.insert(
                id.to_string(),
                json!({
                    "rest": handle.rest.retry_state_snapshot(),
                    "ws": {
                        "connected": handle.ws.is_connected(),
                        "reconnect_count": handle.ws.reconnect_count(),
                        "retry": handle.ws.retry_state_snapshot(),
                    }
                }),
            );
        }
        Value::Object(per_account)
    }

    pub async fn shutdown(&self) {
        let mut accounts = self.accounts.lock();
        for (_, handle) in accounts.drain() {
            handle.ws.stop();
            handle.poll_task.abort();
            handle.orders_task.abort();
            handle.ws_task.abort();
        }
        info!("supervisor shutdown complete");
    }
}
