//! Persona environment: role definitions mapped onto managed instances.
//!
//! A persona runtime binds one role to exactly one managed instance. The
//! environment enforces singleton roles, composes each instance's opening
//! role prompt, routes messages between personas, and keeps per-persona
//! statistics. Supervisor lifecycle events flow back in through a listener
//! task: an instance error flips the owning persona to `error`, a restart
//! rebinds it to the replacement instance without losing its identity.
//!
//! State machine per persona runtime:
//!
//! ```text
//! spawning -> active <-> busy
//! active <-> suspended
//! any -> error
//! active/idle/error/suspended -> terminated (removed)
//! ```

pub mod memory;
pub mod role;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};
use crate::supervisor::{InstanceEvent, InstanceSupervisor, RoleConfig};

pub use memory::{Fact, PersonaMemory};
pub use role::{Capability, RoleConstraints, RoleDefinition, RoleStore, StaticRoleStore};

/// Status of a persona runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonaStatus {
    /// Alive with no task assigned.
    Idle,
    /// Alive; may hold a task.
    Active,
    /// A message exchange is in flight.
    Busy,
    /// The underlying instance failed; needs suspend/resume or termination.
    Error,
    Suspended,
}

/// Per-persona statistics snapshot.
#[derive(Debug, Clone)]
pub struct PersonaStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One role bound to one managed instance.
#[derive(Debug, Clone)]
pub struct PersonaRuntime {
    /// Runtime identity: the role id verbatim for singleton roles,
    /// `<role-id>-<millis>-<seq>` otherwise.
    pub id: String,
    pub role: RoleDefinition,
    /// Current managed instance; rebound on restart.
    pub instance_id: Uuid,
    pub status: PersonaStatus,
    /// Identity of the task the persona is currently working, if any.
    pub current_task: Option<String>,
    pub memory: PersonaMemory,
    pub stats: PersonaStats,
}

impl PersonaRuntime {
    /// Alive and able to take a task.
    fn is_available(&self) -> bool {
        matches!(self.status, PersonaStatus::Idle | PersonaStatus::Active)
            && self.current_task.is_none()
    }

    /// Counted against the active-persona resource caps.
    fn counts_as_active(&self) -> bool {
        matches!(
            self.status,
            PersonaStatus::Idle | PersonaStatus::Active | PersonaStatus::Busy
        )
    }
}

/// A queued inter-persona message.
#[derive(Debug, Clone)]
pub struct PersonaMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl PersonaMessage {
    /// Render the single delivered message for this queue entry.
    fn rendered(&self) -> String {
        format!(
            "Message from {from} [{subject}] at {ts}:\n{content}",
            from = self.from,
            subject = self.subject,
            ts = self.sent_at.to_rfc3339(),
            content = self.content
        )
    }
}

/// Maps roles onto managed instances and routes persona traffic.
#[derive(Clone)]
pub struct PersonaEnvironment {
    supervisor: InstanceSupervisor,
    roles: Arc<dyn RoleStore>,
    runtimes: Arc<RwLock<HashMap<String, PersonaRuntime>>>,
    queues: Arc<Mutex<HashMap<String, VecDeque<PersonaMessage>>>>,
    seq: Arc<AtomicU64>,
}

impl PersonaEnvironment {
    /// Create the environment and start the supervisor event listener.
    pub fn new(supervisor: InstanceSupervisor, roles: Arc<dyn RoleStore>) -> Self {
        let env = Self {
            supervisor: supervisor.clone(),
            roles,
            runtimes: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
        };
        tokio::spawn(Self::listen_for_instance_events(
            supervisor.subscribe(),
            Arc::clone(&env.runtimes),
        ));
        env
    }

    pub fn supervisor(&self) -> &InstanceSupervisor {
        &self.supervisor
    }

    /// Spawn a persona for `role_id`.
    ///
    /// Fails with a constraint violation when the role is a singleton and a
    /// runtime with that role id is already live. The composed role prompt
    /// (base prompt, project guidelines, enabled capabilities, constraints)
    /// becomes the instance's first message; an initialization message then
    /// flips the persona from `idle` to `active`.
    pub async fn spawn_persona(
        &self,
        role_id: &str,
        task_description: Option<String>,
    ) -> Result<PersonaRuntime> {
        let role = self
            .roles
            .get_role(role_id)
            .ok_or_else(|| OrchestrationError::not_found("role", role_id))?;

        if role.singleton && self.has_runtime_for_role(role_id).await {
            return Err(OrchestrationError::Constraint(format!(
                "singleton role {role_id} already has an active runtime"
            )));
        }

        let runtime_id = if role.singleton {
            role.id.clone()
        } else {
            format!(
                "{}-{}-{}",
                role.id,
                Utc::now().timestamp_millis(),
                self.seq.fetch_add(1, Ordering::SeqCst)
            )
        };

        let prompt = self.compose_role_prompt(&role);
        let branch = role
            .constraints
            .as_ref()
            .and_then(|c| c.allowed_branches.first().cloned());

        let instance = self
            .supervisor
            .spawn(RoleConfig {
                role_id: role.id.clone(),
                role_kind: role.kind.clone(),
                branch,
                role_prompt: Some(prompt),
                env: HashMap::from([
                    ("DROVER_ROLE".to_string(), role.id.clone()),
                    ("DROVER_ROLE_KIND".to_string(), role.kind.clone()),
                ]),
            })
            .await?;

        let runtime = PersonaRuntime {
            id: runtime_id.clone(),
            role,
            instance_id: instance.id,
            status: PersonaStatus::Idle,
            current_task: task_description.clone(),
            memory: PersonaMemory::new(),
            stats: PersonaStats {
                tasks_completed: 0,
                tasks_failed: 0,
                last_error: None,
                created_at: Utc::now(),
            },
        };

        {
            let mut runtimes = self.runtimes.write().await;
            // Re-check under the lock; a concurrent spawn may have won.
            if runtime.role.singleton && runtimes.contains_key(&runtime_id) {
                drop(runtimes);
                let _ = self.supervisor.terminate(instance.id).await;
                return Err(OrchestrationError::Constraint(format!(
                    "singleton role {role_id} already has an active runtime"
                )));
            }
            runtimes.insert(runtime_id.clone(), runtime);
        }
        self.queues
            .lock()
            .await
            .entry(runtime_id.clone())
            .or_default();

        let init = match &task_description {
            Some(task) => format!(
                "You are now persona {runtime_id}. Your current task:\n{task}"
            ),
            None => format!(
                "You are now persona {runtime_id}. Await task assignments."
            ),
        };

        match self.supervisor.send(instance.id, &init).await {
            Ok(_) => {
                self.set_status(&runtime_id, PersonaStatus::Active).await;
            }
            Err(e) => {
                self.record_error(&runtime_id, &e.to_string()).await;
                return Err(e);
            }
        }

        info!(persona = %runtime_id, role_id = %role_id, "persona spawned");
        Ok(self
            .get_persona(&runtime_id)
            .await
            .ok_or_else(|| OrchestrationError::not_found("persona", runtime_id))?)
    }

    /// Send `text` to a persona and return the agent's reply.
    ///
    /// The persona must be active (or idle); it is `busy` for the duration
    /// of the exchange and returns to `active` on success. Failures are
    /// recorded in the persona's statistics and re-raised.
    pub async fn send_to_persona(&self, runtime_id: &str, text: &str) -> Result<String> {
        let instance_id = {
            let mut runtimes = self.runtimes.write().await;
            let runtime = runtimes
                .get_mut(runtime_id)
                .ok_or_else(|| OrchestrationError::not_found("persona", runtime_id))?;
            if !matches!(
                runtime.status,
                PersonaStatus::Active | PersonaStatus::Idle
            ) {
                return Err(OrchestrationError::not_found(
                    "active persona",
                    runtime_id,
                ));
            }
            runtime.status = PersonaStatus::Busy;
            runtime.instance_id
        };

        match self.supervisor.send(instance_id, text).await {
            Ok(reply) => {
                self.set_status(runtime_id, PersonaStatus::Active).await;
                Ok(reply)
            }
            Err(e) => {
                self.record_error(runtime_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Queue a message from one persona to another.
    ///
    /// The entry is timestamped and identified; if the target is currently
    /// active its queue is flushed immediately, each entry delivered as one
    /// message in arrival order.
    pub async fn send_between_personas(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        content: &str,
    ) -> Result<()> {
        if self.get_persona(to).await.is_none() {
            return Err(OrchestrationError::not_found("persona", to));
        }

        let message = PersonaMessage {
            id: format!(
                "msg-{}-{}",
                Utc::now().timestamp_millis(),
                self.seq.fetch_add(1, Ordering::SeqCst)
            ),
            from: from.to_string(),
            subject: subject.to_string(),
            content: content.to_string(),
            sent_at: Utc::now(),
        };

        debug!(from = %from, to = %to, message_id = %message.id, "inter-persona message queued");
        self.queues
            .lock()
            .await
            .entry(to.to_string())
            .or_default()
            .push_back(message);

        let target_active = self
            .get_persona(to)
            .await
            .is_some_and(|r| matches!(r.status, PersonaStatus::Active | PersonaStatus::Idle));
        if target_active {
            self.flush_queue(to).await?;
        }

        Ok(())
    }

    /// Deliver every queued message for `runtime_id`, oldest first.
    async fn flush_queue(&self, runtime_id: &str) -> Result<()> {
        loop {
            let next = {
                let mut queues = self.queues.lock().await;
                queues.get_mut(runtime_id).and_then(|q| q.pop_front())
            };
            let Some(message) = next else {
                return Ok(());
            };

            if let Err(e) = self.send_to_persona(runtime_id, &message.rendered()).await {
                // Put the undelivered entry back so nothing is lost.
                self.queues
                    .lock()
                    .await
                    .entry(runtime_id.to_string())
                    .or_default()
                    .push_front(message);
                return Err(e);
            }
        }
    }

    /// Flip a persona to `suspended` after a best-effort state snapshot.
    /// The runtime may be in any state.
    pub async fn suspend_persona(&self, runtime_id: &str) -> Result<()> {
        let mut runtimes = self.runtimes.write().await;
        let runtime = runtimes
            .get_mut(runtime_id)
            .ok_or_else(|| OrchestrationError::not_found("persona", runtime_id))?;

        snapshot_state(runtime, "suspended");
        runtime.status = PersonaStatus::Suspended;
        info!(persona = %runtime_id, "persona suspended");
        Ok(())
    }

    /// Reactivate a suspended persona and flush messages queued while it
    /// was away.
    pub async fn resume_persona(&self, runtime_id: &str) -> Result<()> {
        {
            let mut runtimes = self.runtimes.write().await;
            let runtime = runtimes
                .get_mut(runtime_id)
                .ok_or_else(|| OrchestrationError::not_found("persona", runtime_id))?;
            if runtime.status != PersonaStatus::Suspended {
                return Err(OrchestrationError::Constraint(format!(
                    "persona {runtime_id} is not suspended"
                )));
            }
            runtime.status = PersonaStatus::Active;
        }

        info!(persona = %runtime_id, "persona resumed");
        self.flush_queue(runtime_id).await
    }

    /// Snapshot, terminate the underlying instance, drop the runtime and
    /// its message queue.
    pub async fn terminate_persona(&self, runtime_id: &str) -> Result<()> {
        let runtime = {
            let mut runtimes = self.runtimes.write().await;
            let mut runtime = runtimes
                .remove(runtime_id)
                .ok_or_else(|| OrchestrationError::not_found("persona", runtime_id))?;
            snapshot_state(&mut runtime, "terminated");
            runtime
        };
        self.queues.lock().await.remove(runtime_id);

        info!(
            persona = %runtime_id,
            tasks_completed = runtime.stats.tasks_completed,
            tasks_failed = runtime.stats.tasks_failed,
            "persona terminated"
        );

        match self.supervisor.terminate(runtime.instance_id).await {
            Ok(()) => Ok(()),
            // The instance may already be gone (restart race, prior error).
            Err(OrchestrationError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -- read accessors ----------------------------------------------------

    /// All runtimes counting against the active caps.
    pub async fn active_personas(&self) -> Vec<PersonaRuntime> {
        self.runtimes
            .read()
            .await
            .values()
            .filter(|r| r.counts_as_active())
            .cloned()
            .collect()
    }

    /// Active runtimes of one role kind.
    pub async fn personas_by_kind(&self, kind: &str) -> Vec<PersonaRuntime> {
        self.runtimes
            .read()
            .await
            .values()
            .filter(|r| r.counts_as_active() && r.role.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn get_persona(&self, runtime_id: &str) -> Option<PersonaRuntime> {
        self.runtimes.read().await.get(runtime_id).cloned()
    }

    pub async fn persona_stats(&self, runtime_id: &str) -> Option<PersonaStats> {
        self.runtimes
            .read()
            .await
            .get(runtime_id)
            .map(|r| r.stats.clone())
    }

    /// Number of personas counting against the global cap.
    pub async fn count_active(&self) -> usize {
        self.runtimes
            .read()
            .await
            .values()
            .filter(|r| r.counts_as_active())
            .count()
    }

    /// Number of active personas of one role kind.
    pub async fn count_active_by_kind(&self, kind: &str) -> usize {
        self.runtimes
            .read()
            .await
            .values()
            .filter(|r| r.counts_as_active() && r.role.kind == kind)
            .count()
    }

    /// Active-persona counts grouped by role kind.
    pub async fn active_counts_by_kind(&self) -> HashMap<String, usize> {
        let runtimes = self.runtimes.read().await;
        let mut counts = HashMap::new();
        for runtime in runtimes.values().filter(|r| r.counts_as_active()) {
            *counts.entry(runtime.role.kind.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// An available persona of `kind`, if any.
    pub async fn idle_persona_of_kind(&self, kind: &str) -> Option<String> {
        self.runtimes
            .read()
            .await
            .values()
            .filter(|r| r.is_available() && r.role.kind == kind)
            .map(|r| r.id.clone())
            .min()
    }

    /// Whether a persona exists and can take a task.
    pub async fn is_available(&self, runtime_id: &str) -> bool {
        self.runtimes
            .read()
            .await
            .get(runtime_id)
            .is_some_and(|r| r.is_available())
    }

    // -- scheduler lifecycle callbacks -------------------------------------

    /// Record that a task now owns this persona.
    pub async fn assign_task(&self, runtime_id: &str, task_id: &str) -> Result<()> {
        let mut runtimes = self.runtimes.write().await;
        let runtime = runtimes
            .get_mut(runtime_id)
            .ok_or_else(|| OrchestrationError::not_found("persona", runtime_id))?;
        runtime.current_task = Some(task_id.to_string());
        runtime.status = PersonaStatus::Active;
        Ok(())
    }

    /// Task finished: bump the completed counter and idle the persona,
    /// but only if it still owns `task_id` (cancellation may have released
    /// the slot already).
    pub async fn record_task_completed(&self, runtime_id: &str, task_id: &str) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get_mut(runtime_id) {
            if runtime.current_task.as_deref() == Some(task_id) {
                runtime.current_task = None;
                runtime.status = PersonaStatus::Idle;
                runtime.stats.tasks_completed += 1;
            }
        }
    }

    /// Task failed: bump the failed counter and release the slot. The
    /// persona's status is whatever the failure left it in (usually
    /// `error`).
    pub async fn record_task_failed(&self, runtime_id: &str, task_id: &str, error: &str) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get_mut(runtime_id) {
            if runtime.current_task.as_deref() == Some(task_id) {
                runtime.current_task = None;
                runtime.stats.tasks_failed += 1;
                runtime.stats.last_error = Some(error.to_string());
            }
        }
    }

    /// Release a persona's task slot and idle it (task cancellation).
    pub async fn clear_task(&self, runtime_id: &str) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get_mut(runtime_id) {
            runtime.current_task = None;
            if runtime.counts_as_active() {
                runtime.status = PersonaStatus::Idle;
            }
        }
    }

    /// Release the slot only if the persona still owns `task_id`, without
    /// touching the statistics. Used when a discarded late result must not
    /// leave the persona occupied.
    pub async fn clear_task_if(&self, runtime_id: &str, task_id: &str) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get_mut(runtime_id) {
            if runtime.current_task.as_deref() == Some(task_id) {
                runtime.current_task = None;
                if runtime.counts_as_active() {
                    runtime.status = PersonaStatus::Idle;
                }
            }
        }
    }

    // -- internals ---------------------------------------------------------

    async fn has_runtime_for_role(&self, role_id: &str) -> bool {
        self.runtimes
            .read()
            .await
            .values()
            .any(|r| r.role.id == role_id)
    }

    fn compose_role_prompt(&self, role: &RoleDefinition) -> String {
        let mut prompt = role.base_prompt.clone();

        if let Some(guidelines) = self.roles.load_guidelines(&role.id) {
            prompt.push_str("\n\n## Project guidelines\n");
            prompt.push_str(&guidelines);
        }

        let capabilities = role.enabled_capabilities();
        if !capabilities.is_empty() {
            prompt.push_str("\n\n## Capabilities\n");
            for capability in capabilities {
                prompt.push_str("- ");
                prompt.push_str(capability);
                prompt.push('\n');
            }
        }

        if let Some(constraints) = role.constraints.as_ref().filter(|c| !c.is_empty()) {
            prompt.push_str("\n## Constraints\n");
            if !constraints.allowed_branches.is_empty() {
                prompt.push_str(&format!(
                    "- Work only on branches: {}\n",
                    constraints.allowed_branches.join(", ")
                ));
            }
            if !constraints.restricted_paths.is_empty() {
                prompt.push_str(&format!(
                    "- Never modify: {}\n",
                    constraints.restricted_paths.join(", ")
                ));
            }
        }

        prompt
    }

    async fn set_status(&self, runtime_id: &str, status: PersonaStatus) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get_mut(runtime_id) {
            runtime.status = status;
        }
    }

    async fn record_error(&self, runtime_id: &str, message: &str) {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get_mut(runtime_id) {
            runtime.status = PersonaStatus::Error;
            runtime.stats.last_error = Some(message.to_string());
        }
    }

    /// Follow supervisor lifecycle events: errors flip the owning persona
    /// to `error`, restarts rebind it to the replacement instance.
    async fn listen_for_instance_events(
        mut events: broadcast::Receiver<InstanceEvent>,
        runtimes: Arc<RwLock<HashMap<String, PersonaRuntime>>>,
    ) {
        loop {
            match events.recv().await {
                Ok(InstanceEvent::Errored {
                    instance_id,
                    message,
                })
                | Ok(InstanceEvent::RestartsExhausted {
                    instance_id,
                    message,
                }) => {
                    let mut runtimes = runtimes.write().await;
                    if let Some(runtime) = runtimes
                        .values_mut()
                        .find(|r| r.instance_id == instance_id)
                    {
                        warn!(
                            persona = %runtime.id,
                            instance_id = %instance_id,
                            "instance error, persona flagged"
                        );
                        runtime.status = PersonaStatus::Error;
                        runtime.stats.last_error = Some(message);
                    }
                }
                Ok(InstanceEvent::Restarted {
                    old_instance_id,
                    new_instance_id,
                    ..
                }) => {
                    let mut runtimes = runtimes.write().await;
                    if let Some(runtime) = runtimes
                        .values_mut()
                        .find(|r| r.instance_id == old_instance_id)
                    {
                        debug!(
                            persona = %runtime.id,
                            old_instance_id = %old_instance_id,
                            new_instance_id = %new_instance_id,
                            "persona rebound to replacement instance"
                        );
                        runtime.instance_id = new_instance_id;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "persona event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Best-effort snapshot: fold the in-flight task into the fact list so the
/// transition survives in memory.
fn snapshot_state(runtime: &mut PersonaRuntime, transition: &str) {
    let task = runtime
        .current_task
        .clone()
        .unwrap_or_else(|| "none".to_string());
    runtime
        .memory
        .record_fact(format!("{transition}; current task: {task}"));
}
