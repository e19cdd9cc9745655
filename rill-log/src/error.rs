//! Log error types.
//!
//! All errors are explicit and typed. No string errors.

use std::path::PathBuf;

use rill_core::LogPartition;
use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Invalid configuration (retention code, partition count).
    #[error("invalid configuration: {reason}")]
    Configuration {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// Attempted to create a log that already exists.
    #[error("log already exists: {path}")]
    AlreadyExists {
        /// Path of the existing log.
        path: PathBuf,
    },

    /// Log, partition or group does not exist.
    #[error("log not found: {path}")]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// A live tailer already exists for this (queue, partition, group) in
    /// this process.
    #[error("tailer already open for {name}-{partition:02} group {group}")]
    DuplicateTailer {
        /// Queue name.
        name: String,
        /// Partition index.
        partition: u32,
        /// Consumer group.
        group: String,
    },

    /// A seek/commit/reset named a partition the tailer does not own.
    #[error("partition {requested} is not assigned to this tailer")]
    AssignmentMismatch {
        /// The partition that was requested.
        requested: LogPartition,
    },

    /// Operation not supported by this storage backend.
    #[error("operation not supported: {reason}")]
    Unsupported {
        /// Why the operation is unsupported.
        reason: &'static str,
    },

    /// The appender, tailer or tracker has been closed.
    #[error("log resource is closed")]
    Closed,

    /// On-disk data failed validation (bad magic, version or checksum).
    #[error("corrupted data in {path}: {detail}")]
    Corruption {
        /// File containing the corrupt data.
        path: PathBuf,
        /// What failed to validate.
        detail: String,
    },

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl LogError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates on-disk corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LogError::DuplicateTailer {
            name: "events".to_string(),
            partition: 3,
            group: "g1".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("events-03"));
        assert!(msg.contains("g1"));
    }

    #[test]
    fn test_io_constructor() {
        let err = LogError::io("open", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(format!("{err}").contains("open"));
    }
}
