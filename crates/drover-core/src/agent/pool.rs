//! Live agent bookkeeping: the process wrapper proper.
//!
//! One [`AgentPool`] entry exists per live agent. `busy` is the per-instance
//! mutual-exclusion signal: a second `send` against a busy agent fails fast
//! rather than queueing, and callers (the persona environment) serialise by
//! instance affinity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};

use super::trait_def::{AgentRuntime, RuntimeError};

/// Identity of one live agent in the pool.
pub type AgentId = Uuid;

/// Status of one agent entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Idle and accepting a prompt.
    Ready,
    /// An invocation is in flight.
    Busy,
    /// The last invocation failed; the entry stays until stopped.
    Error,
}

struct AgentEntry {
    name: String,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    status: AgentStatus,
    /// Created at instance birth; fired exactly once, by `stop`.
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

/// Tracks live agents and routes prompts to the backing runtime.
#[derive(Clone)]
pub struct AgentPool {
    runtime: Arc<dyn AgentRuntime>,
    agents: Arc<Mutex<HashMap<AgentId, AgentEntry>>>,
}

impl AgentPool {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            runtime,
            agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Name of the backing runtime.
    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Register a new agent bound to `working_dir`, with `env` applied to
    /// every invocation.
    pub async fn create(
        &self,
        name: impl Into<String>,
        working_dir: PathBuf,
        env: HashMap<String, String>,
    ) -> AgentId {
        let id = Uuid::new_v4();
        let name = name.into();
        let mut agents = self.agents.lock().await;
        agents.insert(
            id,
            AgentEntry {
                name: name.clone(),
                working_dir,
                env,
                status: AgentStatus::Ready,
                cancel: CancellationToken::new(),
                created_at: Utc::now(),
            },
        );
        info!(agent_id = %id, name = %name, "agent created");
        id
    }

    /// Run one prompt against agent `id`.
    ///
    /// Fails fast with a constraint violation if the agent is not `ready`;
    /// transitions `ready -> busy -> ready` on success, `-> error` on
    /// failure (the failure is re-raised).
    pub async fn send(&self, id: AgentId, prompt: &str) -> Result<String> {
        let (working_dir, env, cancel) = {
            let mut agents = self.agents.lock().await;
            let entry = agents
                .get_mut(&id)
                .ok_or_else(|| OrchestrationError::not_found("instance", id.to_string()))?;
            if entry.status != AgentStatus::Ready {
                return Err(OrchestrationError::Constraint(format!(
                    "agent {id} is {:?}, expected ready",
                    entry.status
                )));
            }
            entry.status = AgentStatus::Busy;
            (
                entry.working_dir.clone(),
                entry.env.clone(),
                entry.cancel.clone(),
            )
        };

        debug!(agent_id = %id, "agent invocation started");
        let result = self.runtime.invoke(prompt, &working_dir, &env, &cancel).await;

        // The agent may have been stopped while the invocation was in
        // flight; only touch the entry if it still exists.
        {
            let mut agents = self.agents.lock().await;
            if let Some(entry) = agents.get_mut(&id) {
                entry.status = if result.is_ok() {
                    AgentStatus::Ready
                } else {
                    AgentStatus::Error
                };
            }
        }

        result.map_err(|e| match e {
            RuntimeError::Timeout(timeout) => OrchestrationError::Timeout {
                timeout,
                waited_for: format!("response from agent {id}"),
            },
            other => OrchestrationError::ExternalProcess(other.to_string()),
        })
    }

    /// Trigger cancellation and remove `id` from the live set.
    ///
    /// Fails if the agent no longer exists; idempotent stop lives one layer
    /// up, in the supervisor.
    pub async fn stop(&self, id: AgentId) -> Result<()> {
        let mut agents = self.agents.lock().await;
        let entry = agents
            .remove(&id)
            .ok_or_else(|| OrchestrationError::not_found("instance", id.to_string()))?;
        entry.cancel.cancel();
        info!(agent_id = %id, name = %entry.name, "agent stopped");
        Ok(())
    }

    /// Stop every live agent.
    pub async fn stop_all(&self) {
        let mut agents = self.agents.lock().await;
        for (id, entry) in agents.drain() {
            entry.cancel.cancel();
            debug!(agent_id = %id, "agent stopped (stop_all)");
        }
    }

    /// Status of agent `id`, or `None` once it has been stopped.
    pub async fn status(&self, id: AgentId) -> Option<AgentStatus> {
        self.agents.lock().await.get(&id).map(|e| e.status)
    }

    /// Creation time of agent `id`.
    pub async fn created_at(&self, id: AgentId) -> Option<DateTime<Utc>> {
        self.agents.lock().await.get(&id).map(|e| e.created_at)
    }

    /// Number of live agents.
    pub async fn len(&self) -> usize {
        self.agents.lock().await.len()
    }

    /// Whether the pool has no live agents.
    pub async fn is_empty(&self) -> bool {
        self.agents.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Runtime that answers after an optional delay, or always fails.
    struct FakeRuntime {
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeRuntime {
        fn ok() -> Self {
            Self {
                delay: Duration::ZERO,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::ok()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl AgentRuntime for FakeRuntime {
        fn name(&self) -> &str {
            "fake"
        }

        async fn invoke(
            &self,
            prompt: &str,
            _working_dir: &Path,
            _env: &HashMap<String, String>,
            cancel: &CancellationToken,
        ) -> Result<String, RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                }
            }
            if self.fail {
                Err(RuntimeError::Agent("simulated failure".to_string()))
            } else {
                Ok(format!("echo: {prompt}"))
            }
        }
    }

    #[tokio::test]
    async fn create_send_returns_result() {
        let pool = AgentPool::new(Arc::new(FakeRuntime::ok()));
        let id = pool.create("navigator", PathBuf::from("/tmp"), HashMap::new()).await;

        assert_eq!(pool.status(id).await, Some(AgentStatus::Ready));
        let result = pool.send(id, "hello").await.unwrap();
        assert_eq!(result, "echo: hello");
        assert_eq!(pool.status(id).await, Some(AgentStatus::Ready));
    }

    #[tokio::test]
    async fn send_to_unknown_agent_is_not_found() {
        let pool = AgentPool::new(Arc::new(FakeRuntime::ok()));
        let err = pool.send(Uuid::new_v4(), "hello").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_send_fails_fast() {
        let pool = AgentPool::new(Arc::new(FakeRuntime::slow(Duration::from_millis(300))));
        let id = pool.create("worker", PathBuf::from("/tmp"), HashMap::new()).await;

        let pool_clone = pool.clone();
        let first = tokio::spawn(async move { pool_clone.send(id, "long job").await });

        // Give the first send time to flip the status.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.status(id).await, Some(AgentStatus::Busy));

        let err = pool.send(id, "second").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Constraint(_)));

        // The first send still completes normally.
        let result = first.await.unwrap().unwrap();
        assert_eq!(result, "echo: long job");
    }

    #[tokio::test]
    async fn failed_send_marks_error_and_propagates() {
        let pool = AgentPool::new(Arc::new(FakeRuntime::failing()));
        let id = pool.create("worker", PathBuf::from("/tmp"), HashMap::new()).await;

        let err = pool.send(id, "doomed").await.unwrap_err();
        match err {
            OrchestrationError::ExternalProcess(message) => {
                assert!(message.contains("simulated failure"));
            }
            other => panic!("expected ExternalProcess, got {other:?}"),
        }
        assert_eq!(pool.status(id).await, Some(AgentStatus::Error));

        // An errored agent does not accept further prompts.
        let err = pool.send(id, "again").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Constraint(_)));
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_invocation() {
        let pool = AgentPool::new(Arc::new(FakeRuntime::slow(Duration::from_secs(3600))));
        let id = pool.create("worker", PathBuf::from("/tmp"), HashMap::new()).await;

        let pool_clone = pool.clone();
        let send = tokio::spawn(async move { pool_clone.send(id, "forever").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.stop(id).await.unwrap();

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, OrchestrationError::ExternalProcess(_)));
        assert_eq!(pool.status(id).await, None);
    }

    #[tokio::test]
    async fn double_stop_fails_at_this_layer() {
        let pool = AgentPool::new(Arc::new(FakeRuntime::ok()));
        let id = pool.create("worker", PathBuf::from("/tmp"), HashMap::new()).await;

        pool.stop(id).await.unwrap();
        let err = pool.stop(id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stop_all_drains_pool() {
        let pool = AgentPool::new(Arc::new(FakeRuntime::ok()));
        pool.create("a", PathBuf::from("/tmp"), HashMap::new()).await;
        pool.create("b", PathBuf::from("/tmp"), HashMap::new()).await;
        pool.create("c", PathBuf::from("/tmp"), HashMap::new()).await;
        assert_eq!(pool.len().await, 3);

        pool.stop_all().await;
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn timeout_maps_to_timeout_error() {
        struct TimeoutRuntime;

        #[async_trait]
        impl AgentRuntime for TimeoutRuntime {
            fn name(&self) -> &str {
                "timeout"
            }

            async fn invoke(
                &self,
                _prompt: &str,
                _working_dir: &Path,
                _env: &HashMap<String, String>,
                _cancel: &CancellationToken,
            ) -> Result<String, RuntimeError> {
                Err(RuntimeError::Timeout(Duration::from_secs(30)))
            }
        }

        let pool = AgentPool::new(Arc::new(TimeoutRuntime));
        let id = pool.create("worker", PathBuf::from("/tmp"), HashMap::new()).await;
        let err = pool.send(id, "slow").await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Timeout { .. }));
    }
}
