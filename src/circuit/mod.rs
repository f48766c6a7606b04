pub mod breaker;
pub mod registry;


pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitPermit, CircuitSnapshot,
    CircuitState,
};
pub use registry::CircuitRegistry;
