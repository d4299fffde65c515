#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed; the caller should re-read.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backend refused the write (e.g. an admission webhook denial).
    #[error("Rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] vmt_models::KeyError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
