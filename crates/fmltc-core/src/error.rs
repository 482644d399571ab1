// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fmltc-core.
//!
//! Provides a unified error type with a stable error code and an error class
//! that the (external) HTTP layer maps onto response statuses.

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Broad classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad request shape or invalid ranges. Never retried.
    UserInput,
    /// Referenced entity does not exist (or belongs to another team).
    NotFound,
    /// Transient failure of an external service.
    Transient,
    /// Anything else.
    Internal,
}

/// Core errors that can occur while reading or writing state.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Entity was not found.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Entity kind (video, dataset, ...).
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Blob store operation failed.
    #[error("Blob error for '{name}': {details}")]
    Blob {
        /// Blob name.
        name: String,
        /// Error details.
        details: String,
    },

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Payload or entity field could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An external service (training jobs, config cache) failed.
    #[error("External service '{service}' failed: {details}")]
    External {
        /// Service name.
        service: &'static str,
        /// Error details.
        details: String,
    },

    /// Media decoding or encoding failed.
    #[error("Media error: {0}")]
    Media(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for [`CoreError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Blob { .. } => "BLOB_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::External { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Media(_) => "MEDIA_ERROR",
        }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::UserInput,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::External { .. } => ErrorClass::Transient,
            _ => ErrorClass::Internal,
        }
    }

    /// True for [`CoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (CoreError::not_found("video", "v-1"), "NOT_FOUND"),
            (
                CoreError::validation("eval_percent", "must be between 0 and 100"),
                "VALIDATION_ERROR",
            ),
            (
                CoreError::Database {
                    operation: "insert".to_string(),
                    details: "locked".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                CoreError::Blob {
                    name: "a/b".to_string(),
                    details: "denied".to_string(),
                },
                "BLOB_ERROR",
            ),
            (CoreError::Queue("gone".to_string()), "QUEUE_ERROR"),
            (
                CoreError::Serialization("bad".to_string()),
                "SERIALIZATION_ERROR",
            ),
            (
                CoreError::External {
                    service: "training",
                    details: "503".to_string(),
                },
                "EXTERNAL_SERVICE_ERROR",
            ),
            (CoreError::Media("corrupt".to_string()), "MEDIA_ERROR"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::not_found("dataset", "abc-123");
        assert_eq!(err.to_string(), "dataset 'abc-123' not found");

        let err = CoreError::validation("bboxes_text", "expected 5 fields");
        assert_eq!(
            err.to_string(),
            "Validation error for 'bboxes_text': expected 5 fields"
        );

        let err = CoreError::Database {
            operation: "insert".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database error during 'insert': connection refused"
        );
    }

    #[test]
    fn test_error_class() {
        assert_eq!(
            CoreError::validation("x", "y").class(),
            ErrorClass::UserInput
        );
        assert_eq!(CoreError::not_found("model", "m").class(), ErrorClass::NotFound);
        assert_eq!(
            CoreError::External {
                service: "training",
                details: "timeout".to_string()
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CoreError::Queue("x".to_string()).class(),
            ErrorClass::Internal
        );
        assert!(CoreError::not_found("video", "v").is_not_found());
    }
}
