//! Tracing subscriber configuration for mesh nodes.
//!
//! Log levels follow these conventions:
//! - WARN: contained failures an operator should see (inert links)
//! - INFO: link up/down transitions, new sessions
//! - DEBUG: per-packet decisions: drops, relays, bounces, pipe ranking
//! - TRACE: per-pipe sends and raw event delivery

use tracing_subscriber::EnvFilter;

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize the tracing subscriber with sensible defaults.
///
/// Log level can be controlled via the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init() {
    init_with_level("info");
}

/// Initialize with `level` (typically `[logging] level`) unless `RUST_LOG` is set.
pub fn init_with_level(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(level))
        .try_init();
}

/// Initialize the tracing subscriber with JSON output.
pub fn init_json() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter_or("info"))
        .try_init();
}

/// Initialize the tracing subscriber for tests.
///
/// Uses `try_init` so repeated calls across tests are harmless.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_does_not_panic() {
        init_for_tests();
        init_for_tests();
        init_with_level("trace");
    }
}
