/**
 * Backend Error Types
 *
 * One error type for every failure a request handler, the hub, the
 * delivery service or the sync engine can surface.
 *
 * # Error Categories
 *
 * ## Caller errors (4xx)
 *
 * - `Unauthenticated` / `Forbidden` - bad or missing credential
 * - `Validation` - malformed input, unknown operation kind, disallowed table
 * - `NotFound` - unknown notification, operation or conflict
 * - `Conflict` - the state moved under the caller
 * - `DuplicateOperation` - `op_id` already seen for this user
 * - `Busy` - a sync for this user is already running
 * - `Capacity` - session ceiling or queue depth reached
 * - `Protocol` - bad realtime frame
 *
 * ## Server errors (5xx)
 *
 * - `Transient` - store or cache unavailable, upstream timeout
 * - `Fatal` - invariant violation or corrupt data
 */
use axum::http::StatusCode;
use thiserror::Error;

use crate::backend::cache::CacheError;
use crate::backend::store::StoreError;
use crate::shared::SharedError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Input rejected before anything was written
    #[error("Validation error in field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Duplicate operation: {op_id}")]
    DuplicateOperation { op_id: String },

    #[error("Busy: {message}")]
    Busy { message: String },

    #[error("Capacity exceeded: {message}")]
    Capacity { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Safe to retry
    #[error("Temporarily unavailable: {message}")]
    Transient { message: String },

    #[error("Fatal: {message}")]
    Fatal { message: String },
}

impl BackendError {
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn duplicate_operation(op_id: impl Into<String>) -> Self {
        Self::DuplicateOperation {
            op_id: op_id.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::Capacity {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::DuplicateOperation { .. } => StatusCode::CONFLICT,
            Self::Busy { .. } => StatusCode::CONFLICT,
            Self::Capacity { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Protocol { .. } => StatusCode::BAD_REQUEST,
            Self::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable kind, carried in error envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "Unauthenticated",
            Self::Forbidden { .. } => "Forbidden",
            Self::Validation { .. } => "Validation",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::DuplicateOperation { .. } => "DuplicateOperation",
            Self::Busy { .. } => "Busy",
            Self::Capacity { .. } => "Capacity",
            Self::Protocol { .. } => "Protocol",
            Self::Transient { .. } => "Transient",
            Self::Fatal { .. } => "Fatal",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Validation { field, message } => format!("{}: {}", field, message),
            Self::NotFound { entity, key } => format!("{} not found: {}", entity, key),
            Self::DuplicateOperation { op_id } => {
                format!("operation {} has already been queued", op_id)
            }
            Self::Unauthenticated { message }
            | Self::Forbidden { message }
            | Self::Conflict { message }
            | Self::Busy { message }
            | Self::Capacity { message }
            | Self::Protocol { message }
            | Self::Transient { message }
            | Self::Fatal { message } => message.clone(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<SharedError> for BackendError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::ValidationError { field, message } => Self::Validation { field, message },
            SharedError::ProtocolError { message } => Self::Protocol { message },
            SharedError::SerializationError { message } => Self::validation("body", message),
        }
    }
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { entity, key } if entity == "operation" => {
                Self::duplicate_operation(key)
            }
            StoreError::Duplicate { entity, key } => {
                Self::conflict(format!("duplicate {}: {}", entity, key))
            }
            StoreError::NotFound { entity, key } => Self::not_found(entity, key),
            StoreError::Conflict(message) => Self::conflict(message),
            StoreError::Unavailable(message) => Self::transient(message),
            StoreError::Corrupt(message) => Self::fatal(message),
            illegal @ StoreError::IllegalTransition { .. } => Self::fatal(illegal.to_string()),
        }
    }
}

impl From<CacheError> for BackendError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Unavailable(message) => Self::transient(message),
            other => Self::fatal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation("body", err.to_string())
    }
}
