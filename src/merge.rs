use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::cache::Cache;
use crate::durable_sink::DurableSink;

pub const MAX_TRADES_PER_MARKET: usize = 500;
const ORDERS_POSITIONS_TTL: f64 = 120.0;
const TRADES_TTL: f64 = 3600.0;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn trade_identity(trade: &Value) -> Option<String> {
    trade
        .get("id")
        .or_else(|| trade.get("trade_id"))
        .or_else(|| trade.get("timestamp"))
        .map(|v| v.to_string())
}

/// Accepts either an object keyed by market id or a bare array of trades.
/// Arrays are grouped by each trade's own `market_id` field when present,
/// falling back to a single implicit bucket `"0"` otherwise.
fn normalize_trade_frame(frame: &Value) -> HashMap<String, Vec<Value>> {
    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
    match frame {
        Value::Object(map) => {
            for (market_id, trades) in map {
                if let Value::Array(list) = trades {
                    grouped.entry(market_id.clone()).or_default().extend(list.clone());
                }
            }
        }
        Value::Array(list) => {
            for trade in list {
                let market_id = trade
                    .get("market_id")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "0".to_string());
                grouped.entry(market_id).or_default().push(trade.clone());
            }
        }
        _ => warn!("account_all_trades frame was neither object nor array"),
    }
    grouped
}

fn merge_market_bucket(existing: Option<&Vec<Value>>, incoming: &[Value]) -> (Vec<Value>, Vec<Value>) {
    let mut merged: Vec<Value> = existing.cloned().unwrap_or_default();
    let mut seen: std::collections::HashSet<String> =
        merged.iter().filter_map(trade_identity).collect();

    let mut fresh = Vec::new();
    for trade in incoming {
        match trade_identity(trade) {
            Some(id) if seen.contains(&id) => continue,
            Some(id) => {
                seen.insert(id);
            }
            None => {}
        }
        merged.push(trade.clone());
        fresh.push(trade.clone());
    }

    if merged.len() > MAX_TRADES_PER_MARKET {
        let drop = merged.len() - MAX_TRADES_PER_MARKET;
        merged.drain(0..drop);
    }

    (merged, fresh)
}

/// Applies a WS frame's trade payload to the cache, returning every
/// genuinely-new trade so the caller can enqueue it to the durable sink.
pub fn apply_trades(cache: &Cache, account_id: i64, frame: &Value) -> Vec<Value> {
    let key = format!("ws_trades:{account_id}");
    let existing = cache.get(&key);
    let existing_trades: HashMap<String, Vec<Value>> = existing
        .as_ref()
        .and_then(|v| v.get("trades"))
        .map(|v| normalize_trade_frame(v))
        .unwrap_or_default();

    let incoming = frame
        .get("trades")
        .cloned()
        .unwrap_or(Value::Object(Map::new()));
    let incoming_grouped = normalize_trade_frame(&incoming);

    let mut merged_trades: HashMap<String, Vec<Value>> = existing_trades.clone();
    let mut all_fresh = Vec::new();

    for (market_id, incoming_list) in &incoming_grouped {
        let (merged, fresh) = merge_market_bucket(existing_trades.get(market_id), incoming_list);
        merged_trades.insert(market_id.clone(), merged);
        all_fresh.extend(fresh);
    }

    let trades_value: Map<String, Value> = merged_trades
        .into_iter()
        .map(|(k, v)| (k, Value::Array(v)))
        .collect();

    let volumes = json!({
        "total": frame.get("total_volume").cloned().unwrap_or(Value::Null),
        "monthly": frame.get("monthly_volume").cloned().unwrap_or(Value::Null),
        "weekly": frame.get("weekly_volume").cloned().unwrap_or(Value::Null),
        "daily": frame.get("daily_volume").cloned().unwrap_or(Value::Null),
    });

    cache.set(
        key,
        json!({
            "trades": Value::Object(trades_value),
            "volumes": volumes,
            "timestamp": now_secs(),
        }),
        Some(TRADES_TTL),
    );

    all_fresh
}

/// Routes one WS frame to the right cache key(s), then forwards it to the
/// durable sink for every genuinely-new trade it contains. Never touches
/// the broadcast hub — that happens unconditionally in the caller, before
/// this function runs, per the original forward-first ordering.
pub async fn route(cache: &Cache, sink: &dyn DurableSink, account_id: i64, channel: &str, frame: &Value) {
    if channel.starts_with("account_all_orders") {
        cache.set(
            format!("ws_orders:{account_id}"),
            json!({"orders": frame.get("orders").cloned().unwrap_or(Value::Null), "timestamp": now_secs()}),
            Some(ORDERS_POSITIONS_TTL),
        );
    } else if channel.starts_with("account_all_positions") {
        cache.set(
            format!("ws_positions:{account_id}"),
            json!({"positions": frame.get("positions").cloned().unwrap_or(Value::Null), "timestamp": now_secs()}),
            Some(ORDERS_POSITIONS_TTL),
        );
    } else if channel.starts_with("account_all_trades") {
        let fresh = apply_trades(cache, account_id, frame);
        for trade in fresh {
            sink.save_trade(account_id, &trade).await;
        }
    } else if frame.get("account_index").is_some() {
        cache.set(format!("ws_update:{account_id}"), frame.clone(), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_sink::NoopSink;

    #[test]
    fn dedup_preserves_order_and_drops_duplicates() {
        let cache = Cache::new();
        cache.set(
            "ws_trades:7",
            json!({"trades": {"1": [{"id":"a","p":1},{"id":"b","p":2}]}, "volumes": {}, "timestamp": 0}),
            Some(TRADES_TTL),
        );
        let frame = json!({
            "trades": {"1": [{"id":"b","p":2},{"id":"c","p":3}], "2": [{"id":"x","p":9}]},
            "daily_volume": 100,
        });
        apply_trades(&cache, 7, &frame);

        let stored = cache.get("ws_trades:7").unwrap();
        let bucket1: Vec<String> = stored["trades"]["1"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(bucket1, vec!["a", "b", "c"]);
        assert_eq!(stored["trades"]["2"].as_array().unwrap().len(), 1);
        assert_eq!(stored["volumes"]["daily"], json!(100));
    }

    #[test]
    fn retention_caps_bucket_at_500() {
        let cache = Cache::new();
        let incoming: Vec<Value> = (0..600).map(|i| json!({"id": i})).collect();
        let frame = json!({"trades": {"1": incoming}});
        apply_trades(&cache, 1, &frame);
        let stored = cache.get("ws_trades:1").unwrap();
        let bucket = stored["trades"]["1"].as_array().unwrap();
        assert_eq!(bucket.len(), MAX_TRADES_PER_MARKET);
        assert_eq!(bucket.last().unwrap()["id"], json!(599));
    }

    #[test]
    fn same_trade_id_across_two_frames_is_not_duplicated() {
        let cache = Cache::new();
        let frame1 = json!({"trades": {"3": [{"id": "t1", "p": 1}]}});
        apply_trades(&cache, 1, &frame1);
        let frame2 = json!({"trades": {"3": [{"id": "t1", "p": 1}]}});
        apply_trades(&cache, 1, &frame2);
        let stored = cache.get("ws_trades:1").unwrap();
        assert_eq!(stored["trades"]["3"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn route_writes_orders_positions_and_catchall() {
        let cache = Cache::new();
        let sink = NoopSink;

        route(&cache, &sink, 9, "account_all_orders", &json!({"orders": [1,2]})).await;
        assert!(cache.get("ws_orders:9").is_some());

        route(&cache, &sink, 9, "account_all_positions", &json!({"positions": [1]})).await;
        assert!(cache.get("ws_positions:9").is_some());

        route(&cache, &sink, 9, "unknown_channel", &json!({"account_index": 9, "x": 1})).await;
        assert!(cache.get("ws_update:9").is_some());
    }

    #[test]
    fn tolerates_array_shaped_trade_frame() {
        let cache = Cache::new();
        let frame = json!({"trades": [{"id": "a", "market_id": 4}, {"id": "b", "market_id": 4}]});
        apply_trades(&cache, 1, &frame);
        let stored = cache.get("ws_trades:1").unwrap();
        assert_eq!(stored["trades"]["4"].as_array().unwrap().len(), 2);
    }
}
