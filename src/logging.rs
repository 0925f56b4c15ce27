//! Tracing setup for the `gantry` binary.
//!
//! Diagnostics go to stderr through a compact `fmt` layer. When the project
//! has a `.gantry/` directory, the same events are also written to a daily
//! rolling file under `.gantry/logs/`. `RUST_LOG` overrides the default
//! filter (`warn`, or `gantry=debug,info` with `--verbose`).

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("gantry=debug,info")
        } else {
            EnvFilter::new("warn")
        }
    })
}

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must be held for the life of the process.
pub fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let (file_layer, guard) = match log_dir.filter(|d| d.is_dir()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gantry.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (e.g. in tests) is not an error worth surfacing.
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
