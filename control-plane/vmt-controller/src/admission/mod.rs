//! Synchronous checks run before a write reaches storage.
//!
//! Both the in-process [`crate::api::TemplateApi`] and the validating webhook
//! go through these, so the outcome for a given request does not depend on
//! which entry point received it.

mod guard;
mod validator;

pub use guard::DeletionGuard;
pub use validator::Validator;

use vmt_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The request is malformed or references something that does not exist.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Deleting the default TemplateVersion of a live Template.
    #[error("deletion guard: {0}")]
    DeletionGuard(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AdmissionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AdmissionError::Validation(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::Validation(_) => 422,
            AdmissionError::DeletionGuard(_) => 403,
            AdmissionError::Storage(StorageError::NotFound(_)) => 404,
            AdmissionError::Storage(StorageError::AlreadyExists(_))
            | AdmissionError::Storage(StorageError::Conflict(_)) => 409,
            AdmissionError::Storage(StorageError::InvalidKey(_)) => 422,
            AdmissionError::Storage(StorageError::Rejected { code, .. }) => *code,
            AdmissionError::Storage(_) => 500,
        }
    }

    /// Machine-readable reason in the Kubernetes `Status` vocabulary.
    pub fn reason(&self) -> &'static str {
        match self.status_code() {
            403 => "Forbidden",
            404 => "NotFound",
            409 => "Conflict",
            422 => "Invalid",
            _ => "InternalError",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AdmissionError::Validation(_))
    }

    pub fn is_guard_violation(&self) -> bool {
        matches!(self, AdmissionError::DeletionGuard(_))
    }
}
