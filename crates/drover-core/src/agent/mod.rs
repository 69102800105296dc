//! Agent process wrapper.
//!
//! This module owns the boundary to the external agent runtime:
//!
//! ```text
//! AgentPool
//!     |
//!     |  create(name, dir) -> AgentId
//!     |  send(id, prompt) --------> &dyn AgentRuntime::invoke(...)
//!     |  stop(id) / stop_all()          (subprocess, service, or fake)
//! ```
//!
//! [`AgentPool`] tracks one entry per live agent with a
//! `ready -> busy -> ready/error` status cycle and one cancellation token
//! created at instance birth. The [`AgentRuntime`] trait is the opaque
//! backend seam; [`ProcessRuntime`] is the subprocess-backed implementation.

pub mod pool;
pub mod process;
pub mod trait_def;

pub use pool::{AgentId, AgentPool, AgentStatus};
pub use process::{ProcessRuntime, ProcessRuntimeConfig};
pub use trait_def::{AgentRuntime, RuntimeError};
