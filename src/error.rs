//! Error taxonomy for the audit pipeline.
//!
//! `AuditError` is the concrete error type propagated out of handlers into
//! the retry engine and circuit breaker; `ResilienceError<E>` is the generic
//! wrapper those two policies use to report their own outcomes (timeout,
//! circuit-open, retry-exhausted) around whatever inner error they were
//! given.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside `RetryExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Default retryable POSIX-style error codes (spec §4.A).
pub const DEFAULT_RETRYABLE_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "ECONNREFUSED",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "EAI_AGAIN",
    "EPIPE",
    "ECONNABORTED",
];

/// Default retryable message substrings (case-insensitive, spec §4.A).
pub const DEFAULT_RETRYABLE_SUBSTRINGS: &[&str] =
    &["connection", "timeout", "network", "unavailable", "temporary"];

/// The error taxonomy a handler raises, per spec §7.
#[derive(Debug, Clone)]
pub enum AuditError {
    /// Network/db temporary failure, classified by code or message substring.
    Transient { code: Option<String>, message: String },
    /// Non-retryable handler error (validation, schema mismatch, unauthorized).
    Permanent { message: String },
    /// DLQ write failure, partition creation failure, integrity-store failure.
    Infrastructure { message: String },
}

impl AuditError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        AuditError::Transient { code: Some(code.into()), message: message.into() }
    }

    pub fn transient_message(message: impl Into<String>) -> Self {
        AuditError::Transient { code: None, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        AuditError::Permanent { message: message.into() }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        AuditError::Infrastructure { message: message.into() }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            AuditError::Transient { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AuditError::Transient { message, .. }
            | AuditError::Permanent { message }
            | AuditError::Infrastructure { message } => message,
        }
    }

    /// Classify this error as retryable per the configured code set and message
    /// substrings (spec §4.A: retryable iff code matches OR message contains a
    /// substring, case-insensitive).
    pub fn is_retryable(&self, codes: &[String], substrings: &[String]) -> bool {
        if let AuditError::Permanent { .. } | AuditError::Infrastructure { .. } = self {
            return false;
        }
        if let Some(code) = self.code() {
            if codes.iter().any(|c| c.eq_ignore_ascii_case(code)) {
                return true;
            }
        }
        let lower = self.message().to_ascii_lowercase();
        substrings.iter().any(|s| lower.contains(s.to_ascii_lowercase().as_str()))
    }
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditError::Transient { code, message } => match code {
                Some(c) => write!(f, "transient error [{}]: {}", c, message),
                None => write!(f, "transient error: {}", message),
            },
            AuditError::Permanent { message } => write!(f, "permanent error: {}", message),
            AuditError::Infrastructure { message } => write!(f, "infrastructure error: {}", message),
        }
    }
}

impl std::error::Error for AuditError {}

impl PartialEq for AuditError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

/// Unified error type for the retry and circuit-breaker policies.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open (or half-open and already probing).
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The underlying operation failed without exhausting retries (non-retryable).
    Inner(E),
}

impl<E: Clone> Clone for ResilienceError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::CircuitOpen { failure_count, open_duration } => {
                Self::CircuitOpen { failure_count: *failure_count, open_duration: *open_duration }
            }
            Self::RetryExhausted { attempts, failures } => {
                Self::RetryExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failure_count, open_duration } => write!(
                f,
                "circuit breaker open ({} failures, open for {:?})",
                failure_count, open_duration
            ),
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {} attempts ({} failures), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_retryable_by_code() {
        let err = AuditError::transient("ETIMEDOUT", "request timed out");
        let codes: Vec<String> = DEFAULT_RETRYABLE_CODES.iter().map(|s| s.to_string()).collect();
        let subs: Vec<String> = DEFAULT_RETRYABLE_SUBSTRINGS.iter().map(|s| s.to_string()).collect();
        assert!(err.is_retryable(&codes, &subs));
    }

    #[test]
    fn transient_retryable_by_message_substring() {
        let err = AuditError::transient_message("Connection reset by peer");
        let codes: Vec<String> = vec![];
        let subs: Vec<String> = DEFAULT_RETRYABLE_SUBSTRINGS.iter().map(|s| s.to_string()).collect();
        assert!(err.is_retryable(&codes, &subs));
    }

    #[test]
    fn permanent_never_retryable() {
        let err = AuditError::permanent("schema mismatch");
        let codes: Vec<String> = DEFAULT_RETRYABLE_CODES.iter().map(|s| s.to_string()).collect();
        let subs: Vec<String> = DEFAULT_RETRYABLE_SUBSTRINGS.iter().map(|s| s.to_string()).collect();
        assert!(!err.is_retryable(&codes, &subs));
    }

    #[test]
    fn unrecognized_transient_not_retryable() {
        let err = AuditError::transient("EVALIDATION", "schema mismatch");
        let codes: Vec<String> = DEFAULT_RETRYABLE_CODES.iter().map(|s| s.to_string()).collect();
        let subs: Vec<String> = DEFAULT_RETRYABLE_SUBSTRINGS.iter().map(|s| s.to_string()).collect();
        assert!(!err.is_retryable(&codes, &subs));
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err: ResilienceError<AuditError> = ResilienceError::RetryExhausted {
            attempts: 3,
            failures: vec![
                AuditError::transient("ETIMEDOUT", "first"),
                AuditError::transient("ETIMEDOUT", "last"),
            ],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("3"));
        assert!(msg.contains("last"));
    }
}
