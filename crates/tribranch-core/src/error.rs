//! Error types for the triple-branch ROI heads.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing ground-truth field `{0}`")]
    MissingField(String),

    #[error("Feature map `{0}` not found in backbone output")]
    MissingFeature(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a paired-length precondition violation.
    pub fn shape_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message_names_dimension() {
        let err = Error::shape_mismatch("proposals vs targets (images)", 2, 3);
        assert_eq!(
            err.to_string(),
            "Shape mismatch in proposals vs targets (images): expected 2, got 3"
        );
    }

    #[test]
    fn test_json_errors_become_serialization() {
        let err: Error = serde_json::from_str::<Vec<u8>>("[1, ").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
