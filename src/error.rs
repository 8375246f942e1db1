//! Error taxonomy shared by the store and every engine operation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Subject, photo or album has no usable embedding data.
    #[error("not found: {0}")]
    NotFound(String),

    /// The embedding store could not be reached or failed mid-query.
    #[error("embedding store unavailable: {0}")]
    StoreUnavailable(String),

    /// Malformed vectors, boxes, request parameters or stored rows.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A caller-supplied cancellation flag was raised between items.
    #[error("operation cancelled")]
    Cancelled,

    /// Worker threads for a batch scan could not be started.
    #[error("scan workers unavailable: {0}")]
    WorkerPool(String),
}

impl EngineError {
    /// Only store failures are worth retrying, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for EngineError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        EngineError::WorkerPool(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        EngineError::StoreUnavailable(format!("connection lock poisoned: {}", e))
    }
}

/// Reject thresholds that are NaN, infinite or negative.
pub(crate) fn check_threshold(name: &str, value: f32) -> Result<f32> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::InvalidInput(format!(
            "{} must be a finite non-negative number, got {}",
            name, value
        )));
    }
    Ok(value)
}

pub(crate) fn check_limit(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(EngineError::InvalidInput(format!("{} must be at least 1", name)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(EngineError::StoreUnavailable("down".into()).is_retryable());
        assert!(!EngineError::NotFound("alice".into()).is_retryable());
        assert!(!EngineError::InvalidInput("bad".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::WorkerPool("no threads".into()).is_retryable());
    }

    #[test]
    fn test_check_threshold() {
        assert!(check_threshold("t", 0.5).is_ok());
        assert!(check_threshold("t", 0.0).is_ok());
        assert!(check_threshold("t", -0.1).is_err());
        assert!(check_threshold("t", f32::NAN).is_err());
        assert!(check_threshold("t", f32::INFINITY).is_err());
    }

    #[test]
    fn test_check_limit() {
        assert_eq!(check_limit("limit", 3).unwrap(), 3);
        assert!(matches!(check_limit("limit", 0), Err(EngineError::InvalidInput(_))));
    }
}
