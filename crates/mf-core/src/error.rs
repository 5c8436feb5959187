//! Unified error type for mediaforge.
//!
//! Every failure is classified into an [`ErrorKind`]. The kind is what gets
//! attached to a failed job's terminal record and what API handlers use to
//! derive an HTTP status code via [`Error::http_status`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of an [`Error`].
///
/// The first seven kinds make up the job failure taxonomy; the remaining ones
/// only surface at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The pending queue is at capacity. Retryable later.
    QueueFull,
    /// Unknown job or entity reference.
    NotFound,
    /// Workspace allocation failed (disk space, inodes, workspace budget).
    ResourceExhausted,
    /// The external binary is missing or not executable. Not retryable.
    SpawnError,
    /// The external process exceeded its time budget. Retryable.
    Timeout,
    /// The tool rejected the input or options. Retryable with other input.
    ConversionError,
    /// The tool reported success but its output is missing or corrupt.
    IntegrityError,
    /// The job was cancelled before it finished.
    Cancelled,
    /// Request data failed validation.
    #[serde(rename = "validation_error")]
    Validation,
    /// The operation conflicts with the current job state.
    Conflict,
    /// A filesystem operation failed.
    #[serde(rename = "io_error")]
    Io,
    /// Unexpected internal failure.
    #[serde(rename = "internal_error")]
    Internal,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::QueueFull | Self::Timeout | Self::ResourceExhausted)
    }

    /// Stable snake_case identifier, as used in API payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::NotFound => "not_found",
            Self::ResourceExhausted => "resource_exhausted",
            Self::SpawnError => "spawn_error",
            Self::Timeout => "timeout",
            Self::ConversionError => "conversion_error",
            Self::IntegrityError => "integrity_error",
            Self::Cancelled => "cancelled",
            Self::Validation => "validation_error",
            Self::Conflict => "conflict",
            Self::Io => "io_error",
            Self::Internal => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type covering all failure modes in mediaforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The pending queue reached its configured ceiling.
    #[error("Queue full: {depth} jobs pending (capacity {capacity})")]
    QueueFull {
        /// Pending depth at the time of the rejected submission.
        depth: usize,
        /// Configured ceiling.
        capacity: usize,
    },

    /// Workspace or output storage cannot be allocated right now.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An external tool could not be started.
    #[error("Failed to spawn [{tool}]: {message}")]
    Spawn {
        /// Name of the tool.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// An external tool was killed after exceeding its time budget.
    #[error("Timeout [{tool}]: killed after {after:?}")]
    Timeout {
        /// Name of the tool.
        tool: String,
        /// The budget that was exceeded.
        after: Duration,
    },

    /// The conversion (or input acquisition) was rejected by the tool.
    #[error("Conversion error [{tool}]: {message}")]
    Conversion {
        /// Name of the tool or stage.
        tool: String,
        /// Human-readable error description, including retained stderr.
        message: String,
    },

    /// A produced or acquired artifact failed validation.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Work was cancelled on request.
    #[error("Cancelled")]
    Cancelled,

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation is not allowed in the current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Spawn { .. } => ErrorKind::SpawnError,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Conversion { .. } => ErrorKind::ConversionError,
            Error::Integrity(_) => ErrorKind::IntegrityError,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Io { .. } => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::QueueFull => 429,
            ErrorKind::ResourceExhausted => 507,
            ErrorKind::SpawnError => 500,
            ErrorKind::Timeout => 504,
            ErrorKind::ConversionError => 422,
            ErrorKind::IntegrityError => 502,
            ErrorKind::Cancelled => 409,
            ErrorKind::Validation => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Io => 500,
            ErrorKind::Internal => 500,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Spawn`].
    pub fn spawn(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Spawn {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Timeout`].
    pub fn timeout(tool: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            tool: tool.into(),
            after,
        }
    }

    /// Convenience constructor for [`Error::Conversion`].
    pub fn conversion(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Conversion {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
