//! Task scheduling: priority and dependency ordering under resource caps.
//!
//! The scheduler keeps an in-memory task table and runs assignment passes:
//! immediately on every `schedule_task`, and on a fixed interval as the
//! fallback tick. Each pass walks the pending tasks in priority order
//! (creation order within a priority) and hands eligible ones to idle
//! personas, or spawns new personas while the resource caps allow it.
//!
//! State machine per task:
//!
//! ```text
//! pending -> assigned -> running -> (completed | failed)
//! pending/assigned/running -> failed   (cancellation)
//! ```
//!
//! Completion is an explicit future: the task-announcement send resolves
//! with the agent's final text, which becomes the task result. Note the
//! runtime contract cannot distinguish "agent finished the task" from
//! "agent ended its turn"; the resolution of the announcement exchange is
//! taken as completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OrchestrationError, Result};
use crate::persona::PersonaEnvironment;

/// Error text recorded on cancelled tasks.
pub const CANCELLED_MESSAGE: &str = "Task cancelled";

/// Task priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A request to schedule one unit of work.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Role kind the task targets.
    pub role_kind: String,
    pub description: String,
    pub priority: TaskPriority,
    /// Task ids that must complete first.
    pub depends_on: Vec<String>,
    /// Route to this persona runtime when it is active.
    pub pinned_persona: Option<String>,
}

/// One unit of assignable work. Terminal states are immutable.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub role_kind: String,
    pub description: String,
    pub priority: TaskPriority,
    pub depends_on: Vec<String>,
    pub pinned_persona: Option<String>,
    pub status: TaskStatus,
    pub assigned_persona: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Creation sequence; breaks priority ties.
    seq: u64,
}

/// Process-wide ceilings read on every assignment attempt.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Ceiling on concurrently active personas.
    pub max_active_personas: usize,
    /// Per-role-kind ceilings; kinds not listed fall back to the global cap.
    pub per_kind: HashMap<String, usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_active_personas: 8,
            per_kind: HashMap::new(),
        }
    }
}

impl ResourceLimits {
    fn kind_cap(&self, kind: &str) -> usize {
        self.per_kind
            .get(kind)
            .copied()
            .unwrap_or(self.max_active_personas)
    }
}

/// Aggregate usage snapshot.
#[derive(Debug, Clone)]
pub struct ResourceUsage {
    pub active_personas: usize,
    pub per_kind: HashMap<String, usize>,
    pub pending_tasks: usize,
    pub running_tasks: usize,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub limits: ResourceLimits,
    /// Fallback assignment tick.
    pub assignment_interval: Duration,
    /// Default bound for [`TaskScheduler::wait_for_task`].
    pub wait_timeout: Duration,
    /// Fixed role-kind to default-role-id mapping used when a new persona
    /// must be spawned for a task.
    pub default_roles: HashMap<String, String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            assignment_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(300),
            default_roles: HashMap::new(),
        }
    }
}

/// Owns the task table and drives assignment. Cheap to clone.
#[derive(Clone)]
pub struct TaskScheduler {
    env: PersonaEnvironment,
    config: SchedulerConfig,
    tasks: Arc<RwLock<HashMap<String, ScheduledTask>>>,
    seq: Arc<AtomicU64>,
    /// Serialises assignment passes: the interval tick and the immediate
    /// pass from `schedule_task` never interleave.
    pass_lock: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new(env: PersonaEnvironment, config: SchedulerConfig) -> Self {
        Self {
            env,
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            pass_lock: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn environment(&self) -> &PersonaEnvironment {
        &self.env
    }

    /// Register a task and immediately attempt an assignment pass.
    ///
    /// Returns a fresh task id (`task-<millis>-<seq>`). The task starts
    /// `pending`; the pass may move it further before callers observe it.
    pub async fn schedule_task(&self, spec: TaskSpec) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("task-{}-{}", Utc::now().timestamp_millis(), seq);

        let task = ScheduledTask {
            id: id.clone(),
            role_kind: spec.role_kind,
            description: spec.description,
            priority: spec.priority,
            depends_on: spec.depends_on,
            pinned_persona: spec.pinned_persona,
            status: TaskStatus::Pending,
            assigned_persona: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            result: None,
            error: None,
            seq,
        };
        self.tasks.write().await.insert(id.clone(), task);

        info!(task_id = %id, "task scheduled");
        self.run_assignment_pass().await;
        id
    }

    /// One full assignment pass over the pending tasks.
    ///
    /// Skipped entirely while the global active-persona cap is reached.
    /// Pending tasks are attempted in priority order with creation-order
    /// ties; an ineligible task (unmet dependencies, role-kind cap) is
    /// passed over without blocking later tasks.
    pub async fn run_assignment_pass(&self) {
        let _guard = self.pass_lock.lock().await;

        if self.env.count_active().await >= self.config.limits.max_active_personas {
            debug!("assignment pass skipped: global persona cap reached");
            return;
        }

        let mut pending: Vec<ScheduledTask> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .cloned()
                .collect()
        };
        pending.sort_by_key(|t| (t.priority, t.seq));

        for task in pending {
            if !self.dependencies_met(&task).await {
                continue;
            }

            let kind_count = self.env.count_active_by_kind(&task.role_kind).await;
            let idle = self.env.idle_persona_of_kind(&task.role_kind).await;
            let under_kind_cap = kind_count < self.config.limits.kind_cap(&task.role_kind);
            if !under_kind_cap && idle.is_none() {
                continue;
            }

            // Target selection: pinned persona, then an idle persona of the
            // kind, then a fresh spawn.
            let mut target: Option<String> = None;
            if let Some(pinned) = task.pinned_persona.as_deref() {
                if self.env.is_available(pinned).await {
                    target = Some(pinned.to_string());
                }
            }
            let target = match target.or(idle.clone()) {
                Some(existing) => existing,
                None => {
                    if self.env.count_active().await
                        >= self.config.limits.max_active_personas
                    {
                        continue;
                    }
                    match self.spawn_for(&task).await {
                        Ok(runtime_id) => runtime_id,
                        Err(e) => {
                            warn!(task_id = %task.id, error = %e, "assignment failed");
                            self.mark_failed(&task.id, &e.to_string()).await;
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = self.hand_off(&task, &target).await {
                warn!(task_id = %task.id, persona = %target, error = %e, "hand-off failed");
                self.mark_failed(&task.id, &e.to_string()).await;
            }
        }
    }

    /// Run the fallback assignment tick until [`TaskScheduler::stop`].
    pub async fn run_assignment_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.assignment_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_assignment_pass().await,
                _ = self.shutdown.cancelled() => {
                    info!("assignment loop stopped");
                    return;
                }
            }
        }
    }

    /// Halt the periodic assignment tick (orderly shutdown).
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Cancel a task.
    ///
    /// Terminal tasks are immutable and fail the call. A running task's
    /// persona is idled and its slot released; the in-flight agent call is
    /// deliberately NOT interrupted (the instance's cancellation handle is
    /// untouched) -- the exchange runs to completion and its late result is
    /// discarded.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let assigned = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| OrchestrationError::not_found("task", task_id))?;

            if task.status.is_terminal() {
                return Err(OrchestrationError::Constraint(format!(
                    "task {task_id} is already {:?}",
                    task.status
                )));
            }

            let assigned = if task.status == TaskStatus::Running {
                task.assigned_persona.clone()
            } else {
                None
            };

            task.status = TaskStatus::Failed;
            task.error = Some(CANCELLED_MESSAGE.to_string());
            task.completed_at = Some(Utc::now());
            assigned
        };

        if let Some(persona) = assigned {
            self.env.clear_task(&persona).await;
        }

        info!(task_id = %task_id, "task cancelled");
        Ok(())
    }

    /// Wait until a task reaches a terminal state.
    ///
    /// `timeout` defaults to the configured wait bound (5 minutes unless
    /// overridden).
    pub async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ScheduledTask> {
        let bound = timeout.unwrap_or(self.config.wait_timeout);
        let deadline = tokio::time::Instant::now() + bound;

        loop {
            let task = self
                .get_task(task_id)
                .await
                .ok_or_else(|| OrchestrationError::not_found("task", task_id))?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestrationError::Timeout {
                    timeout: bound,
                    waited_for: format!("task {task_id}"),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn tasks_by_status(&self, status: TaskStatus) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub async fn all_tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Aggregate resource usage.
    pub async fn resource_usage(&self) -> ResourceUsage {
        let tasks = self.tasks.read().await;
        let pending_tasks = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count();
        let running_tasks = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count();
        drop(tasks);

        ResourceUsage {
            active_personas: self.env.count_active().await,
            per_kind: self.env.active_counts_by_kind().await,
            pending_tasks,
            running_tasks,
        }
    }

    // -- internals ---------------------------------------------------------

    /// All prerequisites completed? Unknown prerequisite ids never complete.
    async fn dependencies_met(&self, task: &ScheduledTask) -> bool {
        if task.depends_on.is_empty() {
            return true;
        }
        let tasks = self.tasks.read().await;
        task.depends_on.iter().all(|dep| {
            tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    /// Spawn a fresh persona for the task's role kind.
    async fn spawn_for(&self, task: &ScheduledTask) -> Result<String> {
        let role_id = self
            .config
            .default_roles
            .get(&task.role_kind)
            .ok_or_else(|| {
                OrchestrationError::not_found("default role for kind", &*task.role_kind)
            })?;
        let runtime = self
            .env
            .spawn_persona(role_id, Some(task.description.clone()))
            .await?;
        Ok(runtime.id)
    }

    /// Record the assignment, deliver the announcement, and arm the
    /// completion future.
    async fn hand_off(&self, task: &ScheduledTask, persona: &str) -> Result<()> {
        {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task.id)
                .ok_or_else(|| OrchestrationError::not_found("task", &*task.id))?;
            entry.assigned_persona = Some(persona.to_string());
            entry.assigned_at = Some(Utc::now());
            entry.status = TaskStatus::Assigned;
        }
        self.env.assign_task(persona, &task.id).await?;
        {
            let mut tasks = self.tasks.write().await;
            if let Some(entry) = tasks.get_mut(&task.id) {
                entry.status = TaskStatus::Running;
            }
        }

        info!(task_id = %task.id, persona = %persona, "task assigned");

        let announcement = format!(
            "New task {id} ({priority:?} priority):\n{description}",
            id = task.id,
            priority = task.priority,
            description = task.description
        );

        let scheduler = self.clone();
        let task_id = task.id.clone();
        let persona = persona.to_string();
        tokio::spawn(async move {
            match scheduler.env.send_to_persona(&persona, &announcement).await {
                Ok(result) => scheduler.complete(&task_id, &persona, result).await,
                Err(e) => {
                    let message = scheduler
                        .env
                        .persona_stats(&persona)
                        .await
                        .and_then(|s| s.last_error)
                        .unwrap_or_else(|| e.to_string());
                    scheduler.fail(&task_id, &persona, &message).await;
                }
            }
        });

        Ok(())
    }

    /// Completion-future landing: record the result unless the task was
    /// cancelled while the exchange was in flight.
    async fn complete(&self, task_id: &str, persona: &str, result: String) {
        let recorded = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(task_id) {
                Some(task) if task.status == TaskStatus::Running => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(Utc::now());
                    task.result = Some(result);
                    true
                }
                _ => false,
            }
        };

        if recorded {
            self.env.record_task_completed(persona, task_id).await;
            info!(task_id = %task_id, persona = %persona, "task completed");
        } else {
            // Cancelled while the exchange was in flight; the late result
            // is discarded but the persona's slot must still come free.
            debug!(task_id = %task_id, "late completion discarded");
            self.env.clear_task_if(persona, task_id).await;
        }
    }

    async fn fail(&self, task_id: &str, persona: &str, message: &str) {
        self.mark_failed(task_id, message).await;
        self.env.record_task_failed(persona, task_id, message).await;
    }

    /// Move a non-terminal task to `failed` with `message`.
    async fn mark_failed(&self, task_id: &str, message: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Failed;
                task.error = Some(message.to_string());
                task.completed_at = Some(Utc::now());
                warn!(task_id = %task_id, error = %message, "task failed");
            }
        }
    }
}
