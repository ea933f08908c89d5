//! Stargrade · Grading Backend
//!
//! - Axum HTTP + WebSocket API for grading cartridge submissions
//! - Remote AI grading for free-text fields, with our own OpenAI-backed endpoint
//!
//! Important env variables:
//!   PORT                  : u16 (default 3000)
//!   CARTRIDGE_CONFIG_PATH : path to TOML config (prompts + cartridges)
//!   AI_GRADER_URL         : AI grading service base URL (default: this server)
//!   AI_GRADER_TIMEOUT_SECS: per-request timeout for AI grading (default 20)
//!   OPENAI_API_KEY        : enables `/api/ai/grade` on this server if present
//!   OPENAI_BASE_URL       : default "https://api.openai.com/v1"
//!   OPENAI_MODEL          : default "gpt-4o-mini"
//!   LOG_LEVEL             : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT            : "pretty" (default) or "json"

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use stargrade::routes::build_router;
use stargrade::state::AppState;
use stargrade::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Read port from env or default to 3000.
  let port = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()).unwrap_or(3000);

  // Registries, AI clients, prompts and the submission tracker.
  let state = Arc::new(AppState::new(port));

  // Build the HTTP router with routes, CORS and tracing layers.
  let app = build_router(state);

  let addr = SocketAddr::from(([0, 0, 0, 0], port));
  let listener = TcpListener::bind(addr).await?;
  info!(target: "stargrade_backend", %addr, "HTTP server listening");
  axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
  info!(target: "stargrade_backend", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "stargrade_backend", error = %e, "Failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
}
