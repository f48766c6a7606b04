//! Tracing subscriber setup for embedding processes and tests.

use crate::env::{DEFAULT_LOG_FILTER, LOG_FILTER_ENV};
use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (or [`DEFAULT_LOG_FILTER`]).
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(default_filter: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or(DEFAULT_LOG_FILTER)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
