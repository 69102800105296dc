//! The `AgentRuntime` trait -- the seam to the external agent backend.
//!
//! The orchestration engine never talks to a language model directly; it
//! hands a prompt and a working directory to an `AgentRuntime` and gets a
//! final textual result back (or a failure). The trait is object-safe so a
//! runtime can be shared as `Arc<dyn AgentRuntime>` across the pool, the
//! supervisor, and tests.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failures surfaced by an agent runtime invocation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime process/service could not be started.
    #[error("failed to start agent runtime: {message}")]
    Spawn {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// The runtime ran but reported a failure of its own.
    #[error("{0}")]
    Agent(String),

    /// The runtime produced output we could not interpret, or exited
    /// without a terminal result.
    #[error("agent runtime protocol error: {0}")]
    Protocol(String),

    /// No terminal result arrived within the response bound.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The invocation was cancelled through its cancellation token.
    #[error("agent invocation cancelled")]
    Cancelled,
}

/// An opaque external agent backend.
///
/// Implementations must be safe to invoke from multiple instances
/// concurrently; per-instance serialisation is the caller's job (the pool
/// enforces it through the `busy` status).
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Human-readable runtime name (e.g. "process").
    fn name(&self) -> &str;

    /// Run one prompt to completion inside `working_dir`, with `env`
    /// merged into the runtime's environment.
    ///
    /// Returns the runtime's final textual result. Implementations must
    /// observe `cancel` and abandon the invocation (returning
    /// [`RuntimeError::Cancelled`]) when it fires.
    async fn invoke(
        &self,
        prompt: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError>;
}

// Compile-time assertion: AgentRuntime must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentRuntime) {}
};
