// =============================================================================
// feed-aggregator — Main Entry Point
// =============================================================================
//
// Loads account configuration from the environment, builds the supervisor,
// spawns every account's REST poller and WS connector, and serves the
// query/broadcast API until a Ctrl+C shuts everything down cleanly.
// =============================================================================

mod api;
mod auth;
mod broadcast;
mod cache;
mod config;
mod durable_sink;
mod error_log;
mod merge;
mod rest_connector;
mod supervisor;
mod telemetry;
mod types;
mod ws_connector;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::GlobalSettings;
use crate::durable_sink::{DurableSink, NoopSink, PostgrestSink};
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = GlobalSettings::from_env();
    let accounts = config::load_accounts_from_env();

    if accounts.is_empty() {
        warn!("no accounts configured; the aggregator will serve an empty cache");
    }

    let sink: Arc<dyn DurableSink> = match PostgrestSink::from_env() {
        Some(sink) => {
            info!("durable sink enabled");
            Arc::new(sink)
        }
        None => {
            info!("durable sink disabled (no credentials)");
            Arc::new(NoopSink)
        }
    };

    let supervisor = Arc::new(Supervisor::new(settings.clone(), sink));
    supervisor.start(accounts)?;

    let app = api::router(supervisor.clone());
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("axum server crashed");
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    server.abort();
    supervisor.shutdown().await;

    Ok(())
}
