//! `drover run` command: run every task in a roster to completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use drover_core::agent::{AgentPool, ProcessRuntime, ProcessRuntimeConfig};
use drover_core::persona::PersonaEnvironment;
use drover_core::roster::RosterToml;
use drover_core::scheduler::{
    ResourceLimits, SchedulerConfig, TaskScheduler, TaskSpec, TaskStatus,
};
use drover_core::supervisor::{InstanceSupervisor, SupervisorConfig};
use drover_core::workspace::WorkspaceAllocator;

use crate::config::ResolvedConfig;

pub struct RunOptions {
    pub repo: Option<PathBuf>,
}

/// Run the run command.
pub async fn run_roster(
    roster_path: &Path,
    options: &RunOptions,
    resolved: &ResolvedConfig,
) -> Result<()> {
    let roster = RosterToml::load(roster_path)
        .with_context(|| format!("failed to load roster {}", roster_path.display()))?;
    roster.validate().context("roster validation failed")?;

    let repo = options
        .repo
        .clone()
        .or_else(|| roster.roster.repo.clone())
        .map(Ok)
        .unwrap_or_else(|| std::env::current_dir().context("cannot determine current directory"))?;

    let runtime_command = roster
        .roster
        .runtime_command
        .clone()
        .unwrap_or_else(|| resolved.runtime_command.clone());

    println!("Running roster: {}", roster.roster.name);
    println!("  Repository: {}", repo.display());
    println!("  Agent runtime: {runtime_command}");
    println!("  Tasks: {}", roster.tasks.len());

    // Wire the stack bottom-up.
    let runtime = ProcessRuntime::new(ProcessRuntimeConfig {
        command: runtime_command,
        args: Vec::new(),
        response_timeout: resolved.response_timeout,
    });
    let allocator =
        WorkspaceAllocator::new(&repo, None).context("repository is not usable for workspaces")?;
    let supervisor = InstanceSupervisor::new(
        AgentPool::new(Arc::new(runtime)),
        allocator,
        SupervisorConfig::default(),
    );
    let environment = PersonaEnvironment::new(supervisor.clone(), Arc::new(roster.role_store()));

    let max_active = roster
        .roster
        .max_active_personas
        .unwrap_or(resolved.max_active_personas);
    let scheduler = TaskScheduler::new(
        environment,
        SchedulerConfig {
            limits: ResourceLimits {
                max_active_personas: max_active,
                per_kind: roster.roster.per_kind_caps.clone(),
            },
            wait_timeout: resolved.task_timeout,
            default_roles: roster.default_roles(),
            ..SchedulerConfig::default()
        },
    );

    // Background loops: fallback assignment tick and instance health checks.
    let health_cancel = CancellationToken::new();
    let health_supervisor = supervisor.clone();
    let health_token = health_cancel.clone();
    let health_handle =
        tokio::spawn(async move { health_supervisor.run_health_loop(health_token).await });
    let loop_scheduler = scheduler.clone();
    let loop_handle = tokio::spawn(async move { loop_scheduler.run_assignment_loop().await });

    // Graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    // Schedule in dependency order, translating roster names to task ids.
    let mut ids_by_name: HashMap<String, String> = HashMap::new();
    let mut scheduled: Vec<(String, String)> = Vec::new();
    for task in roster.topological_order().context("roster has a dependency cycle")? {
        let depends_on = task
            .depends_on
            .iter()
            .map(|name| ids_by_name[name.as_str()].clone())
            .collect();
        let id = scheduler
            .schedule_task(TaskSpec {
                role_kind: task.kind.clone(),
                description: task.description.clone(),
                priority: task.priority,
                depends_on,
                pinned_persona: task.pinned_persona.clone(),
            })
            .await;
        tracing::debug!(task = %task.name, task_id = %id, "roster task scheduled");
        ids_by_name.insert(task.name.clone(), id.clone());
        scheduled.push((task.name.clone(), id));
    }

    // Wait for every task, bailing out on cancellation.
    let mut failed = 0usize;
    let mut interrupted = false;
    for (name, id) in &scheduled {
        let outcome = tokio::select! {
            outcome = scheduler.wait_for_task(id, None) => outcome,
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
        };

        match outcome {
            Ok(task) => {
                let mark = match task.status {
                    TaskStatus::Completed => "ok",
                    _ => {
                        failed += 1;
                        "FAILED"
                    }
                };
                println!("  [{mark}] {name}");
                if let Some(error) = &task.error {
                    println!("        {error}");
                }
            }
            Err(e) => {
                failed += 1;
                println!("  [FAILED] {name}: {e}");
            }
        }
    }

    // Orderly teardown: stop the loops, then the personas and workspaces.
    scheduler.stop();
    health_cancel.cancel();
    let _ = loop_handle.await;
    let _ = health_handle.await;

    if let Err(e) = supervisor.cleanup().await {
        eprintln!("cleanup: {e:#}");
    }

    let usage = scheduler.resource_usage().await;
    println!();
    if interrupted {
        println!("Interrupted; {}/{} tasks finished.", scheduled.len() - usage.pending_tasks - usage.running_tasks, scheduled.len());
        std::process::exit(130);
    }
    if failed > 0 {
        println!("Roster finished with {failed} failed task(s).");
        std::process::exit(1);
    }
    println!("Roster completed. All {} tasks passed.", scheduled.len());

    Ok(())
}
