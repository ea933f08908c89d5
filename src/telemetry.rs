//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! - LOG_LEVEL holds the filter directives. The default keeps grading decisions at debug:
//!   "info,grading=debug,stargrade_backend=debug,tower_http=info,axum=info".
//! - LOG_FORMAT picks "pretty" (default), "compact" or "json".
//!
//! Grading logs use the `grading` target; server lifecycle logs use `stargrade_backend`.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info,grading=debug,stargrade_backend=debug,tower_http=info,axum=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global subscriber. A second call is a no-op, so tests may call it freely.
pub fn init_tracing() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        Ok("compact") => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!(target: "stargrade_backend", "Tracing subscriber already installed");
    }
}
