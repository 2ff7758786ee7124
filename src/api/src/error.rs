//! Error taxonomy shared by every permsync crate
//!
//! Backend-native failures are classified into these variants at the
//! storage/messaging boundary so callers only ever match on one enum.

use crate::subject::SubjectId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PermsError>;

/// Engine error type
#[derive(Debug, Error)]
pub enum PermsError {
    /// Backend unreachable after bounded retries
    #[error("storage unavailable during {operation} ({subject}): {message}")]
    StorageUnavailable {
        subject: String,
        operation: &'static str,
        message: String,
    },

    /// Permanent rejection of a mutation (malformed context, constraint violation)
    #[error("invalid mutation of {subject}: {message}")]
    InvalidMutation { subject: String, message: String },

    /// Persisted data could not be decoded
    #[error("corrupt record for {subject}: {message}")]
    CorruptRecord { subject: String, message: String },

    /// Another mutation for the same subject is in flight
    #[error("subject {subject} is busy with another mutation")]
    Busy { subject: String },

    /// No cached value and storage unreachable
    #[error("cannot resolve {subject}: {message}")]
    ResolutionUnavailable { subject: String, message: String },

    /// Subject does not exist
    #[error("subject not found: {subject}")]
    NotFound { subject: String },

    /// Messaging transport failure
    #[error("messaging error ({transport}): {message}")]
    Messaging {
        transport: &'static str,
        message: String,
    },

    /// Serialization/Deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl PermsError {
    /// Create a storage unavailable error
    pub fn unavailable<S: Into<String>>(
        subject: impl ToString,
        operation: &'static str,
        msg: S,
    ) -> Self {
        PermsError::StorageUnavailable {
            subject: subject.to_string(),
            operation,
            message: msg.into(),
        }
    }

    /// Create an invalid mutation error
    pub fn invalid<S: Into<String>>(subject: impl ToString, msg: S) -> Self {
        PermsError::InvalidMutation {
            subject: subject.to_string(),
            message: msg.into(),
        }
    }

    /// Create a corrupt record error
    pub fn corrupt<S: Into<String>>(subject: impl ToString, msg: S) -> Self {
        PermsError::CorruptRecord {
            subject: subject.to_string(),
            message: msg.into(),
        }
    }

    /// Create a busy error
    pub fn busy(subject: &SubjectId) -> Self {
        PermsError::Busy {
            subject: subject.to_string(),
        }
    }

    /// Create a not found error
    pub fn not_found(subject: &SubjectId) -> Self {
        PermsError::NotFound {
            subject: subject.to_string(),
        }
    }

    /// Create a messaging error
    pub fn messaging<S: Into<String>>(transport: &'static str, msg: S) -> Self {
        PermsError::Messaging {
            transport,
            message: msg.into(),
        }
    }

    /// Transient failures a caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PermsError::StorageUnavailable { .. } | PermsError::Busy { .. }
        )
    }

    /// Failures worth retrying inside the storage layer itself
    pub fn is_transient(&self) -> bool {
        matches!(self, PermsError::StorageUnavailable { .. })
    }
}

impl From<serde_json::Error> for PermsError {
    fn from(err: serde_json::Error) -> Self {
        PermsError::Serialization(err.to_string())
    }
}
