pub mod adaptive;
pub mod registry;
pub mod strategy;


pub use adaptive::{AdaptiveConfig, AdaptiveRetry};
pub use registry::RetryRegistry;
pub use strategy::{
    ExponentialBackoff, FixedDelay, LinearBackoff, RetryConfig, RetryDecision, RetryStrategy,
    RetryStrategyKind,
};
