//! Managed-instance supervision: spawn, restart, health checks, teardown.
//!
//! A managed instance is one agent process plus its isolated workspace and
//! restart bookkeeping. The supervisor owns the instance table exclusively;
//! observers follow along through the broadcast event stream.
//!
//! State machine per instance:
//!
//! ```text
//! spawning -> ready/error <-> busy -> (error | stopped)
//! ```
//!
//! Restart replaces the agent process and re-keys the instance under a new
//! identity while keeping the workspace and role configuration. Errors are
//! funneled through one path -- synchronous send failures and health-loop
//! detections alike trigger a restart attempt while under the cap, then a
//! terminal `RestartsExhausted` signal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentId, AgentPool, AgentStatus};
use crate::error::{OrchestrationError, Result};
use crate::workspace::WorkspaceAllocator;

/// Role configuration carried by a managed instance.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    /// Role identifier (e.g. "navigator").
    pub role_id: String,
    /// Role kind used for scheduling caps (e.g. "worker").
    pub role_kind: String,
    /// Branch to check out in the workspace; detached HEAD when absent.
    pub branch: Option<String>,
    /// Prompt applied as the instance's first message.
    pub role_prompt: Option<String>,
    /// Environment variables for the agent process.
    pub env: HashMap<String, String>,
}

/// Status of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Spawning,
    Ready,
    Busy,
    Error,
    Stopped,
}

/// One supervised agent process with its workspace and restart bookkeeping.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    pub id: Uuid,
    /// Handle into the agent pool; replaced on restart.
    pub agent_id: AgentId,
    pub status: InstanceStatus,
    pub workspace: PathBuf,
    pub role: RoleConfig,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

/// Lifecycle notifications published by the supervisor.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    Spawned {
        instance_id: Uuid,
        role_id: String,
    },
    Errored {
        instance_id: Uuid,
        message: String,
    },
    Restarted {
        old_instance_id: Uuid,
        new_instance_id: Uuid,
        restarts: u32,
    },
    /// The restart cap is exhausted; the instance stays in `error` and
    /// requires manual intervention.
    RestartsExhausted {
        instance_id: Uuid,
        message: String,
    },
    Terminated {
        instance_id: Uuid,
    },
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Restarts allowed per instance before the terminal signal.
    pub max_restart_attempts: u32,
    /// Health-loop tick interval.
    pub health_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Owns the managed-instance table. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InstanceSupervisor {
    pool: AgentPool,
    allocator: WorkspaceAllocator,
    config: SupervisorConfig,
    instances: Arc<Mutex<HashMap<Uuid, ManagedInstance>>>,
    events: broadcast::Sender<InstanceEvent>,
}

impl InstanceSupervisor {
    pub fn new(pool: AgentPool, allocator: WorkspaceAllocator, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pool,
            allocator,
            config,
            instances: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    /// Lifecycle events as a `Stream`.
    pub fn event_stream(&self) -> BroadcastStream<InstanceEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Spawn a new managed instance: workspace, agent process, role prompt.
    ///
    /// A failure at any step rolls back everything already created -- no
    /// orphaned workspace stays registered and no instance entry survives.
    pub async fn spawn(&self, role: RoleConfig) -> Result<ManagedInstance> {
        let instance_id = Uuid::new_v4();
        let workspace = self.allocator.allocate(instance_id, role.branch.as_deref())?;

        let agent_id = self
            .pool
            .create(&role.role_id, workspace.clone(), role.env.clone())
            .await;

        let instance = ManagedInstance {
            id: instance_id,
            agent_id,
            status: InstanceStatus::Spawning,
            workspace: workspace.clone(),
            role: role.clone(),
            created_at: Utc::now(),
            last_health_check: None,
            restart_count: 0,
        };
        self.instances.lock().await.insert(instance_id, instance);

        if let Some(prompt) = role.role_prompt.as_deref() {
            if let Err(e) = self.pool.send(agent_id, prompt).await {
                // Roll back: unregister, stop the agent, release the
                // workspace so a later list does not show the failed path.
                self.instances.lock().await.remove(&instance_id);
                let _ = self.pool.stop(agent_id).await;
                if let Err(release_err) = self.allocator.release(&workspace) {
                    error!(
                        instance_id = %instance_id,
                        error = %release_err,
                        "failed to release workspace after spawn failure; operator attention required"
                    );
                }
                return Err(e);
            }
        }

        let instance = self
            .set_status(instance_id, InstanceStatus::Ready)
            .await
            .ok_or_else(|| OrchestrationError::not_found("instance", instance_id.to_string()))?;

        info!(instance_id = %instance_id, role_id = %role.role_id, "instance spawned");
        let _ = self.events.send(InstanceEvent::Spawned {
            instance_id,
            role_id: role.role_id,
        });

        Ok(instance)
    }

    /// Stop the agent process, release the workspace, drop bookkeeping.
    pub async fn terminate(&self, instance_id: Uuid) -> Result<()> {
        let instance = self
            .instances
            .lock()
            .await
            .remove(&instance_id)
            .ok_or_else(|| OrchestrationError::not_found("instance", instance_id.to_string()))?;

        // Idempotent at this level: the agent may already be gone.
        let _ = self.pool.stop(instance.agent_id).await;
        self.allocator.release(&instance.workspace)?;

        info!(instance_id = %instance_id, "instance terminated");
        let _ = self.events.send(InstanceEvent::Terminated { instance_id });
        Ok(())
    }

    /// Replace the agent process, keeping workspace and role configuration.
    ///
    /// The replacement gets a fresh identity and `restart_count + 1`. Fails
    /// with a constraint violation once the cap is reached. If re-applying
    /// the role prompt fails, the old identity is restored (in `error`,
    /// with the attempt counted) so further attempts stay cap-bounded.
    pub async fn restart(&self, instance_id: Uuid) -> Result<ManagedInstance> {
        let old = {
            let mut instances = self.instances.lock().await;
            let old = instances
                .get(&instance_id)
                .cloned()
                .ok_or_else(|| OrchestrationError::not_found("instance", instance_id.to_string()))?;
            if old.restart_count >= self.config.max_restart_attempts {
                return Err(OrchestrationError::Constraint(format!(
                    "instance {instance_id} reached the restart cap ({})",
                    self.config.max_restart_attempts
                )));
            }
            instances.remove(&instance_id);
            old
        };

        let _ = self.pool.stop(old.agent_id).await;

        let new_id = Uuid::new_v4();
        let agent_id = self
            .pool
            .create(&old.role.role_id, old.workspace.clone(), old.role.env.clone())
            .await;

        if let Some(prompt) = old.role.role_prompt.as_deref() {
            if let Err(e) = self.pool.send(agent_id, prompt).await {
                let _ = self.pool.stop(agent_id).await;
                let mut failed = old.clone();
                failed.status = InstanceStatus::Error;
                failed.restart_count += 1;
                self.instances.lock().await.insert(instance_id, failed);
                return Err(e);
            }
        }

        let replacement = ManagedInstance {
            id: new_id,
            agent_id,
            status: InstanceStatus::Ready,
            workspace: old.workspace,
            role: old.role,
            created_at: Utc::now(),
            last_health_check: None,
            restart_count: old.restart_count + 1,
        };
        self.instances
            .lock()
            .await
            .insert(new_id, replacement.clone());

        info!(
            old_instance_id = %instance_id,
            new_instance_id = %new_id,
            restarts = replacement.restart_count,
            "instance restarted"
        );
        let _ = self.events.send(InstanceEvent::Restarted {
            old_instance_id: instance_id,
            new_instance_id: new_id,
            restarts: replacement.restart_count,
        });

        Ok(replacement)
    }

    /// Route one prompt to an instance's agent.
    ///
    /// A runtime failure funnels into the shared error path (restart attempt
    /// or terminal signal) before the failure is re-raised. A fail-fast
    /// busy rejection is not an instance error and propagates untouched.
    pub async fn send(&self, instance_id: Uuid, prompt: &str) -> Result<String> {
        let agent_id = {
            let instances = self.instances.lock().await;
            instances
                .get(&instance_id)
                .map(|i| i.agent_id)
                .ok_or_else(|| OrchestrationError::not_found("instance", instance_id.to_string()))?
        };

        self.set_status(instance_id, InstanceStatus::Busy).await;

        match self.pool.send(agent_id, prompt).await {
            Ok(text) => {
                self.set_status(instance_id, InstanceStatus::Ready).await;
                Ok(text)
            }
            Err(e @ OrchestrationError::Constraint(_)) => {
                // Another send holds the slot; mirror the pool's view.
                if let Some(status) = self.pool.status(agent_id).await {
                    let mirrored = match status {
                        AgentStatus::Ready => InstanceStatus::Ready,
                        AgentStatus::Busy => InstanceStatus::Busy,
                        AgentStatus::Error => InstanceStatus::Error,
                    };
                    self.set_status(instance_id, mirrored).await;
                }
                Err(e)
            }
            Err(e) => {
                self.handle_instance_error(instance_id, e.to_string()).await;
                Err(e)
            }
        }
    }

    /// One full health pass over every managed instance.
    pub async fn run_health_check(&self) {
        let snapshot: Vec<(Uuid, AgentId)> = {
            let instances = self.instances.lock().await;
            instances.values().map(|i| (i.id, i.agent_id)).collect()
        };

        for (instance_id, agent_id) in snapshot {
            let agent_status = self.pool.status(agent_id).await;

            {
                let mut instances = self.instances.lock().await;
                if let Some(instance) = instances.get_mut(&instance_id) {
                    instance.last_health_check = Some(Utc::now());
                }
            }

            if agent_status == Some(AgentStatus::Error) {
                warn!(instance_id = %instance_id, "health check found agent in error");
                self.handle_instance_error(
                    instance_id,
                    "health check: agent process in error".to_string(),
                )
                .await;
            }
        }
    }

    /// Periodic health checks until `cancel` fires.
    pub async fn run_health_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_health_check().await,
                _ = cancel.cancelled() => {
                    info!("health loop stopped");
                    return;
                }
            }
        }
    }

    /// Shared error path: restart while under the cap, then the terminal
    /// signal. Loops so a restart whose prompt re-application fails is
    /// itself treated as the next error, still bounded by the cap.
    async fn handle_instance_error(&self, instance_id: Uuid, message: String) {
        let mut message = message;
        loop {
            let under_cap = {
                let mut instances = self.instances.lock().await;
                match instances.get_mut(&instance_id) {
                    Some(instance) => {
                        instance.status = InstanceStatus::Error;
                        instance.restart_count < self.config.max_restart_attempts
                    }
                    // Instance already gone (terminated or re-keyed by a
                    // concurrent restart); nothing to do.
                    None => return,
                }
            };

            let _ = self.events.send(InstanceEvent::Errored {
                instance_id,
                message: message.clone(),
            });

            if !under_cap {
                error!(
                    instance_id = %instance_id,
                    message = %message,
                    "restart cap exhausted; manual intervention required"
                );
                let _ = self.events.send(InstanceEvent::RestartsExhausted {
                    instance_id,
                    message,
                });
                return;
            }

            match self.restart(instance_id).await {
                Ok(_) => return,
                Err(OrchestrationError::Constraint(m)) => {
                    let _ = self.events.send(InstanceEvent::RestartsExhausted {
                        instance_id,
                        message: m,
                    });
                    return;
                }
                Err(e) => {
                    // Old identity restored in `error` with the attempt
                    // counted; go around again.
                    message = e.to_string();
                }
            }
        }
    }

    /// Terminate every managed instance in parallel, then prune orphaned
    /// workspaces. All failures are logged; the first is returned.
    pub async fn cleanup(&self) -> Result<()> {
        let ids: Vec<Uuid> = {
            let instances = self.instances.lock().await;
            instances.keys().copied().collect()
        };

        let results =
            futures::future::join_all(ids.iter().map(|id| self.terminate(*id))).await;

        let mut first_error = None;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                error!(instance_id = %id, error = %e, "cleanup: terminate failed");
                first_error.get_or_insert(e);
            }
        }

        self.allocator.prune_orphaned()?;

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Instance by id.
    pub async fn get(&self, instance_id: Uuid) -> Option<ManagedInstance> {
        self.instances.lock().await.get(&instance_id).cloned()
    }

    /// All managed instances.
    pub async fn list(&self) -> Vec<ManagedInstance> {
        self.instances.lock().await.values().cloned().collect()
    }

    async fn set_status(&self, instance_id: Uuid, status: InstanceStatus) -> Option<ManagedInstance> {
        let mut instances = self.instances.lock().await;
        let instance = instances.get_mut(&instance_id)?;
        instance.status = status;
        Some(instance.clone())
    }
}
