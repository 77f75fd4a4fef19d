use std::io::{self, IsTerminal};

use tracing::metadata::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
///
/// Client processes share the terminal with their server, so everything goes
/// to stderr and stdout stays free for the launched programs.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_LEVEL.into())
        .from_env_lossy();

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());

    // Fails only if a subscriber is already installed, e.g. by a test.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init();
}
