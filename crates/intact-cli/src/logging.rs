use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Diagnostics go to stderr, filtered by `INTACT_LOG` (default `warn`).
/// Set `INTACT_TRACE_FILE` to also capture a full trace in a file.
/// The returned guard flushes the file writer on drop.
pub fn init_logger() -> Option<impl Drop> {
    let filter = EnvFilter::new(env::var("INTACT_LOG").unwrap_or_else(|_| "warn".to_string()));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    if let Ok(path) = env::var("INTACT_TRACE_FILE") {
        let appender = tracing_appender::rolling::never(".", path);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .with(filter)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        None
    }
}
