//! Error types for the tcav-core crate.

use thiserror::Error;

/// Top-level error type for TCAV operations.
#[derive(Debug, Error)]
pub enum TcavError {
    /// A concept or random activation set cannot support a two-class fit.
    #[error("Insufficient data for '{group}': need at least {required} examples, got {actual}")]
    InsufficientData {
        group: String,
        required: usize,
        actual: usize,
    },

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The classifier solver failed on a candidate.
    #[error("Training error: {0}")]
    Training(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TcavError {
    pub fn insufficient_data(group: impl Into<String>, required: usize, actual: usize) -> Self {
        Self::InsufficientData {
            group: group.into(),
            required,
            actual,
        }
    }

    pub fn unknown_layer(layer: impl Into<String>) -> Self {
        Self::UnknownLayer(layer.into())
    }

    pub fn model_unavailable(msg: impl Into<String>) -> Self {
        Self::ModelUnavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Configuration and environment errors come from collaborators and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownLayer(_) | Self::ModelUnavailable(_) | Self::Config(_)
        )
    }
}

impl From<Box<figment::Error>> for TcavError {
    fn from(err: Box<figment::Error>) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TcavError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_message() {
        let err = TcavError::insufficient_data("striped", 2, 1);
        assert_eq!(
            err.to_string(),
            "Insufficient data for 'striped': need at least 2 examples, got 1"
        );
    }

    #[test]
    fn test_configuration_classification() {
        assert!(TcavError::unknown_layer("mixed9z").is_configuration());
        assert!(TcavError::model_unavailable("session closed").is_configuration());
        assert!(!TcavError::invalid_input("bad").is_configuration());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TcavError = io.into();
        assert!(matches!(err, TcavError::Io(_)));
    }
}
