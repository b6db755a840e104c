//! Structured logging initialization.
//!
//! Wires `tracing-subscriber` from [`LoggingOptions`]. The `RUST_LOG`
//! environment variable takes precedence over the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingOptions;

/// Initialize the logging subsystem. Call once, before starting loops.
///
/// Returns quietly if a global subscriber is already installed (useful in
/// tests where several cases share one process).
pub fn init(options: &LoggingOptions) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(options.level.as_str())
    };

    let console_layer = if options.console {
        Some(fmt::layer().with_target(true).with_thread_names(true))
    } else {
        None
    };

    let file_layer = options.file.as_ref().and_then(|path| {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file)),
        )
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
