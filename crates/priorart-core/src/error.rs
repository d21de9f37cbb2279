use thiserror::Error;

/// Errors that can abort a search or a load step
#[derive(Debug, Error)]
pub enum PriorArtError {
    /// The query request is invalid (empty text, inverted date range, bad top_k)
    #[error("Invalid input: {0}")]
    Input(String),

    /// A vector does not have the dimension of the index
    #[error("Dimension mismatch: index has {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Search was called on an index holding no vectors
    #[error("Vector index is empty")]
    EmptyIndex,

    /// The reference distribution cannot be used for calibration
    #[error("Insufficient reference data: {0}")]
    InsufficientReferenceData(String),

    /// The metadata store could not be queried
    #[error("Metadata store unavailable: {0}")]
    StoreUnavailable(String),

    /// The text could not be turned into a vector
    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Malformed record {id}: {reason}")]
    MalformedRecord { id: i64, reason: String },

    #[error("Invalid index file: {0}")]
    IndexFormat(String),

    #[error("Invalid reference file: {0}")]
    ReferenceFile(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A blocking encode or search task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for PriorArtError {
    fn from(err: sqlx::Error) -> Self {
        PriorArtError::StoreUnavailable(err.to_string())
    }
}

impl PriorArtError {
    /// True for errors caused by the caller's request rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PriorArtError::Input(_) | PriorArtError::DimensionMismatch { .. }
        )
    }
}

impl From<tokio::task::JoinError> for PriorArtError {
    fn from(err: tokio::task::JoinError) -> Self {
        PriorArtError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PriorArtError>;
