//! # error
//!
//! Library error types.
//!
//! `EngineError` covers the failure classes the engine distinguishes:
//! configuration problems stop startup, calculation failures are retried on a
//! later tick, and execution failures are counted and logged. `BrokerError`
//! is what an execution collaborator hands back when it rejects a call.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Invalid boundaries or risk parameters. The engine refuses to start.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fewer bars than required inside the range window.
    #[error("Insufficient data: {found} bar(s) in window, need at least {required}")]
    InsufficientData { found: usize, required: usize },

    /// The window holds more bars than the walk may visit, so the range
    /// would only cover part of it.
    #[error("Range window truncated: {found} bar(s) read, walk limit is {max_bars}")]
    WindowTruncated { found: usize, max_bars: usize },

    /// Range window produced a non-positive size.
    #[error("Invalid range: high {high} low {low}")]
    InvalidRange { high: f64, low: f64 },

    /// The execution collaborator rejected a call.
    #[error("Execution failure: {0}")]
    Execution(#[from] BrokerError),

    /// Indexed access past the end of a bounded buffer.
    #[error("Index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
}

/// Rejection returned by an execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct BrokerError {
    /// Venue-specific diagnostic code
    pub code: i32,
    pub message: String,
}

impl BrokerError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::new(10016, "invalid stops");
        assert_eq!(err.to_string(), "[10016] invalid stops");

        let wrapped: EngineError = err.into();
        assert!(wrapped.to_string().contains("invalid stops"));
    }
}
