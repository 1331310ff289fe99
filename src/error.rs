//! Error types for triplecast.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions. Pattern and store errors are surfaced synchronously;
//! delivery errors stay inside the delivery engine and drive retry policy.

use thiserror::Error;

/// Errors raised while validating or evaluating a conjunctive pattern.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Invalid pattern: {reason}")]
    InvalidPattern { reason: String },

    #[error("Unknown filter function: {name}")]
    UnknownFunction { name: String },
}

/// Errors raised by the fact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Resource exhausted: fact limit of {limit} reached")]
    ResourceExhausted { limit: usize },

    #[error("Poisoned lock: {context}")]
    Poisoned { context: &'static str },
}

/// Transport-level delivery failures. Retried per QoS, never surfaced to
/// registration callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Delivery to {target} failed: {reason}")]
    Failed { target: String, reason: String },
}

/// Top-level error type for triplecast operations.
#[derive(Debug, Error)]
pub enum CastError {
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Worker channel disconnected: {path}")]
    Disconnected { path: &'static str },

    #[error("Unknown topic: {topic}")]
    UnknownTopic { topic: String },
}

impl CastError {
    /// Returns true if this error came from pattern validation.
    #[must_use]
    pub const fn is_pattern(&self) -> bool {
        matches!(self, Self::Pattern(_))
    }

    /// Returns true if this error is a resource limit.
    #[must_use]
    pub const fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::Store(StoreError::ResourceExhausted { .. }))
    }
}

/// Result type alias for triplecast operations.
pub type CastResult<T> = Result<T, CastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_error_display() {
        let err = PatternError::InvalidPattern {
            reason: "pattern has no templates".to_string(),
        };
        assert!(err.to_string().contains("no templates"));

        let err = PatternError::UnknownFunction {
            name: "regex".to_string(),
        };
        assert!(err.to_string().contains("regex"));
    }

    #[test]
    fn cast_error_classification() {
        let err: CastError = StoreError::ResourceExhausted { limit: 10 }.into();
        assert!(err.is_resource_exhausted());
        assert!(!err.is_pattern());

        let err: CastError = PatternError::InvalidPattern {
            reason: "x".to_string(),
        }
        .into();
        assert!(err.is_pattern());
    }

    #[test]
    fn delivery_error_display_names_target() {
        let err = DeliveryError::Failed {
            target: "http://cb.example/hook".to_string(),
            reason: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cb.example"));
        assert!(msg.contains("refused"));
    }
}
