//! Tracing subscriber initialization for the trade agent
//!
//! Console by default; set LOG_DESTINATION=file with LOG_DIR to write daily
//! rolling files instead.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const WORKSPACE_CRATES: &[&str] = &["trade_engine", "trade_wire", "trade_agent"];

/// Initialize the tracing subscriber.
///
/// `verbose` enables debug level for the workspace crates; otherwise RUST_LOG
/// is honored, falling back to info for the workspace and warn elsewhere.
pub fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let directives: Vec<String> = WORKSPACE_CRATES
        .iter()
        .map(|name| format!("{}={}", name, level))
        .collect();
    let fallback = EnvFilter::new(format!("{},warn", directives.join(",")));

    let filter = if verbose {
        fallback
    } else {
        EnvFilter::try_from_default_env().unwrap_or(fallback)
    };

    let to_file = std::env::var("LOG_DESTINATION")
        .map(|v| v.eq_ignore_ascii_case("file"))
        .unwrap_or(false);

    if to_file {
        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
        let file_appender = tracing_appender::rolling::daily(&log_dir, "trade-agent");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        std::mem::forget(guard);
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}
