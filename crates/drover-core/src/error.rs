//! Crate-wide error taxonomy for orchestration operations.
//!
//! The workspace allocator keeps its own [`WorkspaceError`](crate::workspace::WorkspaceError)
//! (git/filesystem failures carry command-level detail); everything above it
//! reports through [`OrchestrationError`].

use std::time::Duration;

use thiserror::Error;

use crate::workspace::WorkspaceError;

/// Errors surfaced by the supervisor, persona environment and scheduler.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// An instance, persona runtime or task id that is not registered.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up ("instance", "persona", "task").
        kind: &'static str,
        id: String,
    },

    /// An operation that would violate a configured constraint
    /// (singleton role already active, restart cap reached, resource caps).
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The external agent runtime failed; the message is surfaced verbatim.
    #[error("agent runtime failure: {0}")]
    ExternalProcess(String),

    /// A workspace (VCS/filesystem) operation failed.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// A correlated response or task wait exceeded its bound.
    #[error("timed out after {timeout:?} waiting for {waited_for}")]
    Timeout {
        timeout: Duration,
        waited_for: String,
    },
}

impl OrchestrationError {
    /// Shorthand for a [`OrchestrationError::NotFound`] value.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;
