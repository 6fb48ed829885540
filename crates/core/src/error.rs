//! Error type shared by every index operation.

use thiserror::Error;

/// Errors returned by the vector index.
///
/// Variants fall into four classes: input errors (rejected before any state
/// changes), state errors (the caller can recover by training or rebuilding),
/// durability errors (propagated from storage) and resource errors.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid distance function: {0}")]
    InvalidDistanceFunction(String),

    #[error("invalid quantization config: {0}")]
    InvalidQuantizationConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("PQ codebook has not been trained")]
    CodebookNotTrained,

    #[error("PQ codes are stale: codebook version {codebook_version}, codes encoded with version {encoded_version}")]
    StaleCodebook {
        codebook_version: u64,
        encoded_version: u64,
    },

    #[error("index is empty")]
    EmptyIndex,

    #[error("build was cancelled before it started")]
    BuildCancelled,

    #[error("maintenance worker is not running")]
    MaintenanceUnavailable,

    #[error("storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("WAL replay inconsistency: {0}")]
    WalReplayInconsistency(String),

    #[error("insufficient training data: {available} vectors available, {required} required")]
    InsufficientTrainingData { available: usize, required: usize },

    #[error("rebuild failed: {0}")]
    RebuildFailed(String),
}

impl IndexError {
    /// Malformed input, rejected synchronously without touching state.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            IndexError::DimensionMismatch { .. }
                | IndexError::InvalidDistanceFunction(_)
                | IndexError::InvalidQuantizationConfig(_)
                | IndexError::InvalidArgument(_)
        )
    }

    /// The index is missing a step the caller can perform (train, rebuild, insert).
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            IndexError::CodebookNotTrained
                | IndexError::StaleCodebook { .. }
                | IndexError::EmptyIndex
                | IndexError::BuildCancelled
                | IndexError::MaintenanceUnavailable
        )
    }

    /// Failure of the underlying storage or log.
    pub fn is_durability_error(&self) -> bool {
        matches!(
            self,
            IndexError::Storage(_)
                | IndexError::Serialization(_)
                | IndexError::CorruptSnapshot(_)
                | IndexError::WalReplayInconsistency(_)
        )
    }
}

impl From<bincode::Error> for IndexError {
    fn from(e: bincode::Error) -> Self {
        IndexError::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let input = IndexError::DimensionMismatch {
            expected: 4,
            actual: 3,
        };
        assert!(input.is_input_error());
        assert!(!input.is_state_error());
        assert!(IndexError::EmptyIndex.is_state_error());
        assert!(IndexError::WalReplayInconsistency("gap".into()).is_durability_error());
        let io: IndexError = std::io::Error::other("disk").into();
        assert!(io.is_durability_error());
        assert!(!IndexError::RebuildFailed("x".into()).is_input_error());
    }

    #[test]
    fn test_error_display() {
        let e = IndexError::DimensionMismatch {
            expected: 8,
            actual: 3,
        };
        assert_eq!(e.to_string(), "dimension mismatch: expected 8, got 3");
    }
}
