//! drover-core: orchestration engine for pools of long-lived AI persona
//! agents.
//!
//! The engine spawns supervised agent processes inside isolated git
//! worktrees, maps role definitions onto them as personas, and assigns
//! queued tasks under priority, dependency and resource constraints.
//!
//! Layering, leaves first:
//!
//! ```text
//! TaskScheduler
//!     |
//! PersonaEnvironment
//!     |
//! InstanceSupervisor
//!     |            \
//! WorkspaceAllocator  AgentPool -> dyn AgentRuntime
//! ```
//!
//! Lifecycle events (spawned, errored, restarted, terminated) flow back up
//! through the supervisor's broadcast stream. All state is in memory; the
//! engine does not survive a process restart.

pub mod agent;
pub mod error;
pub mod persona;
pub mod roster;
pub mod scheduler;
pub mod supervisor;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{OrchestrationError, Result};
