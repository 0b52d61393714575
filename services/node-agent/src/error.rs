//! Error taxonomy for node-local convergence.
//!
//! Only `Fatal`-class errors (process manager, non-"not found" filesystem,
//! persistence) are meant to reach the scheduler. Everything else is absorbed
//! or escalated inside the operation that hit it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::command::CommandError;
use crate::state::StoreError;

/// Errors surfaced by lifecycle and overlay operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Resource is already gone.
    #[error("not found: {0}")]
    NotFound(String),

    /// Process did not reach the target state in time.
    #[error("timeout after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// Control channel could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Malformed external data (metadata, marker files, pid files).
    #[error("parse error: {0}")]
    Parse(String),

    /// Unrecoverable failure.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl AgentError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the target no longer exists.
    ///
    /// Cleanup paths treat these as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::Store(e) => e.is_not_found(),
            Self::Command(e) => e.is_missing(),
            _ => false,
        }
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let io = AgentError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(io.is_not_found());

        let denied = AgentError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"),
        );
        assert!(!denied.is_not_found());

        assert!(AgentError::Store(StoreError::NotFound("dsk".into())).is_not_found());
        assert!(!AgentError::Fatal("boom".into()).is_not_found());
    }
}
