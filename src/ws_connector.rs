// =============================================================================
// Per-account WebSocket connector — subscribe, heartbeat, staged reconnect
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthMinter;
use crate::error_log::ErrorLog;
use crate::telemetry::Telemetry;
use crate::types::{AccountConfig, ErrorKind, ErrorSource, RetryState};

const PING_INTERVAL_SECS: u64 = 30;
const PONG_TIMEOUT_SECS: f64 = 60.0;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// What a WS frame callback gets: the logical channel and the parsed body.
pub type FrameCallback = Arc<dyn Fn(i64, String, Value) + Send + Sync>;

struct Liveness {
    last_pong: AtomicU64,
    last_message: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        let now = now_secs().to_bits();
        Liveness {
            last_pong: AtomicU64::new(now),
            last_message: AtomicU64::new(now),
        }
    }

    fn touch_pong(&self) {
        self.last_pong.store(now_secs().to_bits(), Ordering::Relaxed);
    }

    fn touch_message(&self) {
        self.last_message.store(now_secs().to_bits(), Ordering::Relaxed);
    }

    fn seconds_since_activity(&self) -> f64 {
        let last_pong = f64::from_bits(self.last_pong.load(Ordering::Relaxed));
        let last_message = f64::from_bits(self.last_message.load(Ordering::Relaxed));
        now_secs() - last_pong.max(last_message)
    }
}

/// Persistent per-account WebSocket connector: dial, authenticate,
/// subscribe to the three account channels, read frames, heartbeat, and
/// reconnect with staged backoff on any disconnect.
pub struct WsConnector {
    account: AccountConfig,
    ws_url: String,
    minter: AuthMinter,
    state: RwLock<RetryState>,
    running: AtomicBool,
    connected: AtomicBool,
    reconnect_count: AtomicU64,
    total_messages: AtomicU64,
    telemetry: Arc<Telemetry>,
    errors: Arc<ErrorLog>,
}

impl WsConnector {
    pub fn new(account: AccountConfig, ws_url: String, telemetry: Arc<Telemetry>, errors: Arc<ErrorLog>) -> Self {
        let minter = AuthMinter::new(&account);
        WsConnector {
            account,
            ws_url,
            minter,
            state: RwLock::new(RetryState::default()),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            reconnect_count: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            telemetry,
            errors,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn force_reset(&self) {
        self.state.write().force_reset();
    }

    fn should_skip(&self) -> bool {
        self.state.read().should_skip(now_secs())
    }

    fn retry_interval(&self) -> f64 {
        self.state.read().retry_interval()
    }

    fn record_failure(&self, kind: ErrorKind, message: &str) {
        self.state.write().record_failure(now_secs());
        self.errors.add(
            self.account.account_id,
            &self.account.account_name,
            kind,
            None,
            message,
            ErrorSource::WebSocket,
        );
    }

    fn record_success(&self) {
        self.state.write().record_success(now_secs());
    }

    /// Runs until `stop()` is called. Each iteration dials, subscribes,
    /// reads until disconnect, then sleeps out the current retry interval
    /// before trying again — the same staged backoff the REST connector
    /// uses, advanced on every disconnect cause.
    #[instrument(skip(self, on_frame), fields(account_id = self.account.account_id))]
    pub async fn run(&self, on_frame: FrameCallback) {
        while self.running.load(Ordering::Relaxed) {
            if self.should_skip() {
                tokio::time::sleep(Duration::from_secs_f64(self.retry_interval().min(5.0))).await;
                continue;
            }

            match self.connect_and_read(&on_frame).await {
                Ok(()) => {
                    debug!("ws session ended cleanly");
                }
                Err(e) => {
                    let kind = classify_ws_error(&e);
                    warn!(error = %e, "ws session ended with error");
                    self.record_failure(kind, &e.to_string());
                }
            }

            self.connected.store(false, Ordering::Relaxed);
            self.telemetry.set_ws_connected(false);

            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            let interval = self.retry_interval();
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
        }
    }

    async fn connect_and_read(&self, on_frame: &FrameCallback) -> anyhow::Result<()> {
        let mut request = self.ws_url.clone().into_client_request()?;
        request
            .headers_mut()
            .insert("User-Agent", "feed-aggregator/1.0".parse()?);
        request.headers_mut().insert("Origin", "https://feed-aggregator.local".parse()?);

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        info!(account_id = self.account.account_id, "ws connected");

        let (write, mut read) = ws_stream.split();
        let write = Arc::new(AsyncMutex::new(write));

        let token = self.minter.mint()?;
        for channel in [
            format!("account_all_positions/{}", self.account.account_id),
            format!("account_all_orders/{}", self.account.account_id),
            format!("account_all_trades/{}", self.account.account_id),
        ] {
            let frame = json!({"type": "subscribe", "channel": channel, "auth": token.value});
            write.lock().await.send(Message::Text(frame.to_string())).await?;
        }

        self.record_success();
        self.connected.store(true, Ordering::Relaxed);
        self.telemetry.set_ws_connected(true);

        let liveness = Arc::new(Liveness::new());
        let heartbeat = tokio::spawn(heartbeat_loop(write.clone(), liveness.clone()));

        let result = self.read_loop(&mut read, &liveness, on_frame).await;
        heartbeat.abort();
        result
    }

    async fn read_loop(
        &self,
        read: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
        liveness: &Liveness,
        on_frame: &FrameCallback,
    ) -> anyhow::Result<()> {
        while let Some(message) = read.next().await {
            let message = message?;
            match message {
                Message::Text(text) => {
                    liveness.touch_message();
                    self.total_messages.fetch_add(1, Ordering::Relaxed);
                    self.telemetry.record_ws_message(None);
                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if let Some(channel) = value.get("channel").and_then(|c| c.as_str()) {
                                on_frame(self.account.account_id, channel.to_string(), value.clone());
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed ws frame"),
                    }
                }
                Message::Pong(_) => liveness.touch_pong(),
                Message::Ping(_) => liveness.touch_message(),
                Message::Close(_) => {
                    debug!("ws closed by peer");
                    break;
                }
                Message::Binary(_) | Message::Frame(_) => {}
            }
        }
        Ok(())
    }

    pub fn retry_state_snapshot(&self) -> RetryState {
        self.state.read().clone()
    }
}

async fn heartbeat_loop(
    write: Arc<AsyncMutex<futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >>>,
    liveness: Arc<Liveness>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        if liveness.seconds_since_activity() > PONG_TIMEOUT_SECS {
            warn!("pong timeout exceeded, closing connection");
            let _ = write.lock().await.close().await;
            return;
        }
        if write.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
            return;
        }
    }
}

fn classify_ws_error(err: &anyhow::Error) -> ErrorKind {
    let text = err.to_string();
    if text.contains("429") {
        ErrorKind::Http(429)
    } else if text.contains("connect") || text.contains("connection") {
        ErrorKind::Connection
    } else {
        ErrorKind::Exception
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountConfig {
        AccountConfig {
            account_id: 1,
            account_name: "a".into(),
            api_key_index: 0,
            private_key: "p".into(),
            public_key: "q".into(),
            proxy_url: None,
        }
    }

    fn connector() -> WsConnector {
        WsConnector::new(
            account(),
            "wss://example.invalid/stream".into(),
            Arc::new(Telemetry::new()),
            Arc::new(ErrorLog::new()),
        )
    }

    #[test]
    fn liveness_reports_zero_right_after_construction() {
        let liveness = Liveness::new();
        assert!(liveness.seconds_since_activity() < 1.0);
    }

    #[test]
    fn liveness_tracks_the_most_recent_of_pong_and_message() {
        let liveness = Liveness::new();
        std::thread::sleep(Duration::from_millis(50));
        liveness.touch_message();
        assert!(liveness.seconds_since_activity() < 0.5);
    }

    #[test]
    fn three_failures_mark_disconnected_and_enter_backoff() {
        let c = connector();
        for _ in 0..3 {
            c.record_failure(ErrorKind::Connection, "dropped");
        }
        let state = c.retry_state_snapshot();
        assert!(!state.connected);
        assert!(c.should_skip());
    }

    #[test]
    fn force_reset_clears_state() {
        let c = connector();
        for _ in 0..3 {
            c.record_failure(ErrorKind::Exception, "boom");
        }
        c.force_reset();
        assert!(!c.should_skip());
    }

    #[test]
    fn classify_429_as_http_429() {
        let err = anyhow::anyhow!("received 429 too many requests");
        assert_eq!(classify_ws_error(&err), ErrorKind::Http(429));
    }

    #[test]
    fn classify_connection_refused() {
        let err = anyhow::anyhow!("connection refused");
        assert_eq!(classify_ws_error(&err), ErrorKind::Connection);
    }

    #[test]
    fn stop_prevents_further_run_iterations() {
        let c = connector();
        c.stop();
        assert!(!c.running.load(Ordering::Relaxed));
    }
}
