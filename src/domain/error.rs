// ============================================================
// Layer 3 — Error Types
// ============================================================
// One error enum for every fallible library operation.
// The application and CLI layers wrap these in anyhow with
// extra context; everything below them returns HbirdResult.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for library operations.
pub type HbirdResult<T> = Result<T, HbirdError>;

#[derive(Error, Debug)]
pub enum HbirdError {
    /// A required input was missing or inconsistent before any work began.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The requested dataset, device or measure is not supported by this build.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// The sampler was asked for more patches than the image provides.
    /// Means memory_size is too large for the dataset size and augmentation count.
    #[error("cannot sample {requested} patches, only {available} patches carry a class")]
    InsufficientPatches { requested: usize, available: usize },

    #[error("memory bank capacity {capacity} exceeded (write would end at row {requested_end})")]
    CapacityExceeded { capacity: usize, requested_end: usize },

    #[error("label {label} is outside the {num_classes} known classes")]
    InvalidLabel { label: usize, num_classes: usize },

    #[error("neighbour index build failed: {0}")]
    IndexBuild(String),

    #[error("neighbour index query failed: {0}")]
    IndexQuery(String),

    #[error("io error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted artifact exists but cannot be decoded.
    #[error("corrupt artifact: {0}")]
    Artifact(String),

    /// Tensor data could not be read back from the backend.
    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("data loading failed: {0}")]
    DataLoad(#[from] LoadFailure),
}

/// A sample or batch that could not be produced by a data loader.
///
/// Loader items must be `Clone`, so the failure only keeps the
/// rendered message of the underlying error.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct LoadFailure(pub String);

impl From<HbirdError> for LoadFailure {
    fn from(e: HbirdError) -> Self {
        Self(e.to_string())
    }
}

impl HbirdError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn shape(expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_string(),
            actual:   actual.to_string(),
        }
    }
}
