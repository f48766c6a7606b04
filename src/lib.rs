//! # Provider Relay
//!
//! Resilient dispatch across interchangeable AI model backends. The crate
//! decides which backend should serve a request and shields callers from
//! any single backend's failures.
//!
//! ## Architecture Overview
//!
//! - **[`error`]**: Failure taxonomy and the classifier that normalizes raw adapter errors
//! - **[`retry`]**: Exponential, linear, fixed and adaptive retry strategies
//! - **[`circuit`]**: Per-backend circuit breakers with half-open trial admission
//! - **[`resilience`]**: The executor wrapping every backend call, plus per-backend metrics
//! - **[`backend`]**: Adapter contract, registry and a scripted mock adapter
//! - **[`capability`]**: Active probing, TTL cache and snapshot comparison
//! - **[`selection`]**: Hard-requirement filtering and weighted scoring of candidates
//! - **[`engine`]**: The constructed engine tying everything together
//!
//! ## Features
//!
//! ### 🛡️ Failure Isolation
//! - **Error Classification**: Status, body and transport failures mapped to one taxonomy
//! - **Circuit Breaking**: Open after consecutive failures, single trial on recovery
//! - **Deadline-Aware Retries**: Backoff with jitter, rate-limit hints honored as floors
//!
//! ### 🔍 Capability Discovery
//! - **Functional Probes**: Streaming, structured output, system messages, tool calls, latency
//! - **Confidence Scoring**: Snapshots report how much of the battery produced information
//! - **Drift Detection**: Refreshes are compared against the previous snapshot
//!
//! ### 🎯 Capability-Aware Selection
//! - **Hard Ceilings**: Cost, latency, features and certifications are never violated
//! - **Priority Weighting**: Cost, performance, features or compliance can dominate
//! - **Health Awareness**: Open circuits and exhausted quotas rank last
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use provider_relay::{
//!     BackendRequest, EngineConfig, Feature, MockBackend, ResilienceEngine, SelectionCriteria,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     provider_relay::logging::init_logging(None);
//!
//!     let engine = Arc::new(ResilienceEngine::new(EngineConfig::default())?);
//!     engine.register_backend(Arc::new(MockBackend::fully_capable("primary")));
//!     engine.refresh_all().await;
//!
//!     let criteria = SelectionCriteria::new()
//!         .require_feature(Feature::Streaming)
//!         .with_max_cost_per_1k(0.005);
//!     let response = engine
//!         .dispatch(&criteria, &BackendRequest::new("Summarize this text"), None)
//!         .await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

/// Failure taxonomy and classification.
///
/// Turns raw adapter failures into immutable [`ErrorRecord`]s carrying kind,
/// retryability, backend and timestamp.
pub mod error;

/// Retry strategies and their configuration.
pub mod retry;

/// Per-backend circuit breakers.
pub mod circuit;

/// Resilient execution of backend calls and per-backend metrics.
pub mod resilience;

/// Backend adapter contract.
///
/// Any implementation of [`BackendAdapter`] is pluggable without changes
/// elsewhere in the crate.
pub mod backend;

/// Capability probing, caching and comparison.
pub mod capability;

/// Provider selection against caller criteria.
pub mod selection;

/// The resilience engine.
pub mod engine;

/// TOML-backed engine configuration.
pub mod config;

/// Tracing subscriber setup.
pub mod logging;

/// Environment constants and defaults.
pub mod env;

pub use error::{DispatchError, ErrorKind, ErrorRecord, RawFailure, classify};

pub use retry::{RetryConfig, RetryRegistry, RetryStrategy, RetryStrategyKind};

pub use circuit::{CircuitBreakerConfig, CircuitRegistry, CircuitState};

pub use resilience::{BackendMetrics, MetricsRegistry, ResilientExecutor};

pub use backend::{
    BackendAdapter, BackendProfile, BackendRegistry, BackendRequest, BackendResponse,
    MockBackend, ModelDescriptor, ResponseFragment, ResponseStream,
};

pub use capability::{
    CapabilityCache, CapabilityComparison, CapabilityProber, Feature, ModelType, Pricing,
    ProviderCapabilities, compare,
};

pub use selection::{Priority, ProviderSelector, ScoredCandidate, Selection, SelectionCriteria};

pub use config::EngineConfig;
pub use engine::{RefreshHandle, ResilienceEngine};
