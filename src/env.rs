//! Environment constants for the provider relay.
//!
//! Centralizes names and defaults shared by logging and the capability
//! probe battery.

/// Environment variable holding a tracing filter directive.
pub const LOG_FILTER_ENV: &str = "RUST_LOG";

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "provider_relay=info";

/// Names used by the functional probe battery
pub mod probe {
    /// Tool the tool-calling sub-test asks the model to call.
    pub const TOOL_NAME: &str = "report_probe_status";

    /// Prefix of the random token echoed in the system-message sub-test.
    pub const TOKEN_PREFIX: &str = "probe-";
}
