use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Normalized failure category shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    QuotaExceeded,
    ModelNotFound,
    Validation,
    Timeout,
    Connection,
    ServerError,
    CircuitOpen,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Authentication,
        ErrorKind::RateLimit,
        ErrorKind::QuotaExceeded,
        ErrorKind::ModelNotFound,
        ErrorKind::Validation,
        ErrorKind::Timeout,
        ErrorKind::Connection,
        ErrorKind::ServerError,
        ErrorKind::CircuitOpen,
        ErrorKind::Unknown,
    ];

    /// Whether re-attempting the same call has a reasonable chance of succeeding.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::RateLimit
            | ErrorKind::Timeout
            | ErrorKind::Connection
            | ErrorKind::ServerError
            | ErrorKind::Unknown => true,
            ErrorKind::Authentication
            | ErrorKind::QuotaExceeded
            | ErrorKind::ModelNotFound
            | ErrorKind::Validation
            | ErrorKind::CircuitOpen => false,
        }
    }

    /// Whether a failure of this kind is evidence the backend itself is unhealthy.
    ///
    /// Credential, billing and request-shape problems say nothing about backend
    /// health and must not trip the breaker.
    pub fn counts_toward_circuit(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::ServerError
                | ErrorKind::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "Authentication",
            ErrorKind::RateLimit => "RateLimit",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::ModelNotFound => "ModelNotFound",
            ErrorKind::Validation => "Validation",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Connection => "Connection",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure reported by a backend adapter, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFailure {
    /// The backend answered with a non-success HTTP-like status.
    Http {
        status: u16,
        body: String,
        /// Parsed `Retry-After` style metadata, if the response carried one.
        retry_after: Option<Duration>,
    },
    /// The call did not complete in time.
    Timeout(String),
    /// Connection refused/reset, DNS failure, broken pipe, etc.
    Transport(String),
    /// Vendor-specific error payload without a usable status code.
    Vendor { code: String, message: String },
    /// Anything else the adapter could not describe further.
    Other(String),
}

impl RawFailure {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        RawFailure::Http {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        RawFailure::Http {
            status: 429,
            body: "rate limit exceeded".to_string(),
            retry_after: Some(retry_after),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            RawFailure::Http { status, body, .. } => format!("HTTP {}: {}", status, body),
            RawFailure::Timeout(msg) => format!("timeout: {}", msg),
            RawFailure::Transport(msg) => format!("transport: {}", msg),
            RawFailure::Vendor { code, message } => format!("{}: {}", code, message),
            RawFailure::Other(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Normalized, immutable description of a backend failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error from backend '{backend_id}': {message}")]
pub struct ErrorRecord {
    kind: ErrorKind,
    retryable: bool,
    backend_id: String,
    occurred_at: DateTime<Utc>,
    retry_after_hint: Option<Duration>,
    message: String,
    context: HashMap<String, Value>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, backend_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            backend_id: backend_id.into(),
            occurred_at: Utc::now(),
            retry_after_hint: None,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn circuit_open(backend_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, backend_id, "circuit breaker is open")
    }

    pub fn deadline_exceeded(backend_id: impl Into<String>, attempts: u32) -> Self {
        Self::new(ErrorKind::Timeout, backend_id, "deadline exceeded")
            .with_context("deadline_exceeded", true)
            .with_context("attempts", attempts)
    }

    pub fn with_retry_after(mut self, hint: Duration) -> Self {
        self.retry_after_hint = Some(hint);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Retryable as recorded and as allowed by the category.
    pub fn is_retryable(&self) -> bool {
        self.retryable && self.kind.is_retryable()
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn retry_after_hint(&self) -> Option<Duration> {
        self.retry_after_hint
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, Value> {
        &self.context
    }
}

/// Engine-level failures surfaced to callers of the dispatch layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("No eligible backend: {reason}")]
    NoEligibleBackend { reason: String },
    #[error("Invalid selection criteria: {0}")]
    InvalidCriteria(String),
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    #[error(transparent)]
    Backend(#[from] ErrorRecord),
    #[error("Primary and fallback both failed: primary={primary}; fallback={fallback}")]
    FallbackExhausted {
        primary: Box<ErrorRecord>,
        fallback: Box<ErrorRecord>,
    },
    #[error("All {} candidates failed", attempts.len())]
    AllCandidatesFailed { attempts: Vec<ErrorRecord> },
    #[error("Capability probe failed for '{backend_id}': {reason}")]
    ProbeFailed { backend_id: String, reason: String },
}

impl DispatchError {
    /// Every underlying backend failure carried by this error, in occurrence order.
    pub fn records(&self) -> Vec<&ErrorRecord> {
        match self {
            DispatchError::Backend(record) => vec![record],
            DispatchError::FallbackExhausted { primary, fallback } => {
                vec![primary.as_ref(), fallback.as_ref()]
            }
            DispatchError::AllCandidatesFailed { attempts } => attempts.iter().collect(),
            _ => Vec::new(),
        }
    }
}
