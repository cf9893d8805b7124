//! Shared Error Types
//!
//! Errors that can be produced by the shared data types themselves, before
//! any server component gets involved: decoding an inbound frame, parsing a
//! strategy name, validating a configuration value.
//!
//! # Error Categories
//!
//! - `SerializationError` - JSON serialization/deserialization failures
//! - `ValidationError` - A field carried a value the type does not accept
//! - `ProtocolError` - A realtime frame that is well-formed JSON but not a
//!   frame the hub understands
//!
//! # Usage
//!
//! ```rust
//! use hubsync::shared::error::SharedError;
//!
//! let error = SharedError::validation("table_name", "table is not syncable");
//! assert!(error.to_string().contains("table_name"));
//! ```
use thiserror::Error;

/// Shared error types that can occur on both sides of the wire
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SharedError {
    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    SerializationError {
        /// Human-readable error message
        message: String,
    },

    /// Data validation error
    #[error("Validation error in field '{field}': {message}")]
    ValidationError {
        /// The field that failed validation
        field: String,
        /// Human-readable error message
        message: String,
    },

    /// Realtime frame error
    #[error("Protocol error: {message}")]
    ProtocolError {
        /// Human-readable error message
        message: String,
    },
}

impl SharedError {
    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SharedError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}
