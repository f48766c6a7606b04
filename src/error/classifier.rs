use crate::error::types::{ErrorKind, ErrorRecord, RawFailure};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

static RETRY_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry|try again)[\s_-]*(?:after|in)?[\s:=]*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?",
    )
    .expect("retry hint pattern is valid")
});

const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "invalid api key",
    "invalid_api_key",
    "authentication",
    "permission denied",
    "forbidden",
];
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "overloaded",
];
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "billing",
    "insufficient_quota",
    "credit balance",
    "payment required",
];
const NOT_FOUND_MARKERS: &[&str] = &["model not found", "model_not_found", "unknown model", "does not exist"];
const VALIDATION_MARKERS: &[&str] = &[
    "invalid request",
    "invalid_request",
    "validation",
    "context length",
    "too many tokens",
    "bad request",
];
const TRANSPORT_MARKERS: &[&str] = &[
    "connection",
    "reset by peer",
    "broken pipe",
    "dns",
    "network",
    "refused",
];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline"];
const SERVER_MARKERS: &[&str] = &[
    "internal server error",
    "service unavailable",
    "bad gateway",
    "server_error",
    "upstream",
];

/// Map a raw adapter failure onto the normalized taxonomy.
///
/// Total and side-effect free apart from a log line for unrecognized failures.
pub fn classify(backend_id: &str, failure: &RawFailure) -> ErrorRecord {
    let (kind, hint) = classify_kind(failure);

    let mut record = ErrorRecord::new(kind, backend_id, failure.summary());
    if let Some(hint) = hint {
        record = record.with_retry_after(hint);
    }
    record = match failure {
        RawFailure::Http { status, .. } => record.with_context("status", *status),
        RawFailure::Vendor { code, .. } => record.with_context("vendor_code", code.clone()),
        _ => record,
    };

    if kind == ErrorKind::Unknown {
        warn!(
            backend = backend_id,
            failure = %failure,
            "Unclassified backend failure, treating as retryable"
        );
    }

    record
}

fn classify_kind(failure: &RawFailure) -> (ErrorKind, Option<Duration>) {
    match failure {
        RawFailure::Http {
            status,
            body,
            retry_after,
        } => {
            let text = body.to_lowercase();
            let kind = match *status {
                401 | 403 => ErrorKind::Authentication,
                429 if contains_any(&text, QUOTA_MARKERS) && !contains_any(&text, RATE_LIMIT_MARKERS) => {
                    ErrorKind::QuotaExceeded
                }
                429 => ErrorKind::RateLimit,
                402 => ErrorKind::QuotaExceeded,
                404 => ErrorKind::ModelNotFound,
                // A 4xx body may refine the kind but never make it a transient one.
                400 | 413 | 422 => match classify_text(&text) {
                    Some(
                        kind @ (ErrorKind::Authentication
                        | ErrorKind::RateLimit
                        | ErrorKind::QuotaExceeded
                        | ErrorKind::ModelNotFound),
                    ) => kind,
                    _ => ErrorKind::Validation,
                },
                408 | 504 => ErrorKind::Timeout,
                500..=599 => match classify_text(&text) {
                    Some(ErrorKind::RateLimit) => ErrorKind::RateLimit,
                    _ => ErrorKind::ServerError,
                },
                _ => classify_text(&text).unwrap_or(ErrorKind::Unknown),
            };
            let hint = match kind {
                ErrorKind::RateLimit => retry_after.or_else(|| parse_retry_hint(body)),
                _ => None,
            };
            (kind, hint)
        }
        RawFailure::Timeout(_) => (ErrorKind::Timeout, None),
        RawFailure::Transport(msg) => {
            let text = msg.to_lowercase();
            if contains_any(&text, TIMEOUT_MARKERS) {
                (ErrorKind::Timeout, None)
            } else {
                (ErrorKind::Connection, None)
            }
        }
        RawFailure::Vendor { code, message } => {
            let text = format!("{} {}", code, message).to_lowercase();
            let kind = classify_text(&text).unwrap_or(ErrorKind::Unknown);
            let hint = match kind {
                ErrorKind::RateLimit => parse_retry_hint(message),
                _ => None,
            };
            (kind, hint)
        }
        RawFailure::Other(msg) => {
            let text = msg.to_lowercase();
            let kind = classify_text(&text).unwrap_or(ErrorKind::Unknown);
            let hint = match kind {
                ErrorKind::RateLimit => parse_retry_hint(msg),
                _ => None,
            };
            (kind, hint)
        }
    }
}

/// Keyword classification in taxonomy priority order.
fn classify_text(text: &str) -> Option<ErrorKind> {
    if contains_any(text, AUTH_MARKERS) {
        Some(ErrorKind::Authentication)
    } else if contains_any(text, RATE_LIMIT_MARKERS) {
        Some(ErrorKind::RateLimit)
    } else if contains_any(text, QUOTA_MARKERS) {
        Some(ErrorKind::QuotaExceeded)
    } else if contains_any(text, NOT_FOUND_MARKERS) {
        Some(ErrorKind::ModelNotFound)
    } else if contains_any(text, VALIDATION_MARKERS) {
        Some(ErrorKind::Validation)
    } else if contains_any(text, TIMEOUT_MARKERS) {
        Some(ErrorKind::Timeout)
    } else if contains_any(text, TRANSPORT_MARKERS) {
        Some(ErrorKind::Connection)
    } else if contains_any(text, SERVER_MARKERS) {
        Some(ErrorKind::ServerError)
    } else {
        None
    }
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| text.contains(marker))
}

/// Extract a retry hint such as "retry after 30s" or "try again in 1.5 seconds".
pub fn parse_retry_hint(text: &str) -> Option<Duration> {
    let captures = RETRY_HINT.captures(text)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let unit = captures
        .get(2)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_else(|| "s".to_string());
    let secs = if unit.starts_with("ms") || unit.starts_with("milli") {
        value / 1000.0
    } else if unit.starts_with('m') {
        value * 60.0
    } else {
        value
    };
    Duration::try_from_secs_f64(secs).ok()
}
