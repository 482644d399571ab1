// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error type of prepare functions and action handlers.

use fmltc_core::CoreError;
use fmltc_core::error::ErrorClass;
use fmltc_media::MediaError;

use crate::training::TrainingError;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, ActionError>;

/// Anything that can abort a prepare function or a handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Entity store, blob store or queue failure, or invalid input.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Media decoding or encoding failed.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The training service failed.
    #[error(transparent)]
    Training(#[from] TrainingError),

    /// Building a zip archive failed.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ActionError {
    /// Error class for the boundary layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            ActionError::Core(e) => e.class(),
            ActionError::Training(TrainingError::NotFound(_)) => ErrorClass::NotFound,
            ActionError::Training(_) => ErrorClass::Transient,
            ActionError::Media(_) | ActionError::Zip(_) | ActionError::Io(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ActionError::Core(CoreError::validation(field, message))
    }
}
