//! Progress Engine · learning progress and result-consistency service
//!
//! - Axum HTTP API over the program orchestrator and feedback generator
//! - Stale-while-revalidate read caches with single-flight fetches
//! - Sliding-window rate limiting per caller and endpoint category
//! - Optional OpenAI feedback backend (via environment variables)
//!
//! Important env variables:
//!   PORT               : u16 (default 3000)
//!   OPENAI_API_KEY     : enables the OpenAI feedback backend if present
//!   OPENAI_BASE_URL    : default "https://api.openai.com/v1"
//!   OPENAI_MODEL       : default "gpt-4o-mini"
//!   ENGINE_CONFIG_PATH : path to TOML config (cache, rate limits, prompts, scenario bank)
//!   LOG_LEVEL          : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT         : "pretty" (default) or "json"

mod cache;
mod config;
mod domain;
mod error;
mod feedback;
mod inflight;
mod openai;
mod orchestrator;
mod protocol;
mod rate_limit;
mod repository;
mod routes;
mod seeds;
mod state;
mod telemetry;
mod util;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Build shared application state (repositories, engine components, caches).
  let state = Arc::new(AppState::new());

  spawn_janitor(state.clone(), Duration::from_secs(state.config.cache.cleanup_interval_secs.max(1)));

  // Build the HTTP router with routes, rate limiting, CORS and tracing layers.
  let app = build_router(state.clone());

  // Read port from env or default to 3000.
  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "progress_engine", %addr, "HTTP server listening");
  axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
  info!(target: "progress_engine", "HTTP server stopped");
  Ok(())
}

/// Periodically drop expired cache entries and idle rate-limit windows.
fn spawn_janitor(state: Arc<AppState>, every: Duration) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
      ticker.tick().await;
      let purged = state.purge_expired();
      if purged > 0 {
        debug!(target: "cache", purged, "janitor pass");
      }
    }
  });
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(target: "progress_engine", error = %e, "Failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  info!(target: "progress_engine", "Shutdown signal received");
}
