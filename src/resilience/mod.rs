pub mod executor;
pub mod metrics;

#[cfg(test)]
mod tests;

pub use executor::ResilientExecutor;
pub use metrics::{BackendMetrics, MetricsRegistry};
