//! End-to-end flow: a roster file, a subprocess agent runtime, and the full
//! engine stack from workspace allocation through task completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use drover_core::agent::{AgentPool, ProcessRuntime, ProcessRuntimeConfig};
use drover_core::persona::PersonaEnvironment;
use drover_core::roster::RosterToml;
use drover_core::scheduler::{
    ResourceLimits, SchedulerConfig, TaskScheduler, TaskSpec, TaskStatus,
};
use drover_core::supervisor::{InstanceSupervisor, SupervisorConfig};
use drover_core::workspace::WorkspaceAllocator;

fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init"]);
    run(&["config", "user.email", "test@drover.dev"]);
    run(&["config", "user.name", "Drover Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// A shell script standing in for the agent binary: echoes the first line
/// of its prompt back as the result.
fn write_agent_script(dir: &Path) -> PathBuf {
    let path = dir.join("agent.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         FIRST=$(head -n 1)\n\
         echo \"{\\\"type\\\":\\\"result\\\",\\\"result\\\":\\\"handled: $FIRST\\\"}\"\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

const ROSTER: &str = r#"
[roster]
name = "Integration sweep"
per_kind_caps = { worker = 2 }

[[roles]]
id = "navigator"
name = "Navigator"
kind = "lead"
base_prompt = "You coordinate the work."
singleton = true

[[roles]]
id = "builder"
name = "Builder"
kind = "worker"
base_prompt = "You implement changes."

[[tasks]]
name = "plan"
kind = "lead"
description = "Break the work into steps."
priority = "high"

[[tasks]]
name = "implement"
kind = "worker"
description = "Implement the feature."
depends_on = ["plan"]

[[tasks]]
name = "document"
kind = "worker"
description = "Document the feature."
priority = "low"
depends_on = ["implement"]
"#;

#[tokio::test]
async fn roster_runs_to_completion_and_cleans_up() {
    let (_repo_dir, repo_path) = create_temp_repo();
    let script_dir = TempDir::new().unwrap();
    let checkout_base = TempDir::new().unwrap();
    let agent = write_agent_script(script_dir.path());

    let roster = RosterToml::parse(ROSTER).expect("roster parses");
    roster.validate().expect("roster is valid");

    let runtime = ProcessRuntime::new(ProcessRuntimeConfig {
        command: agent.to_str().unwrap().to_string(),
        args: Vec::new(),
        response_timeout: Duration::from_secs(10),
    });
    let allocator =
        WorkspaceAllocator::new(&repo_path, Some(checkout_base.path().to_path_buf())).unwrap();
    let supervisor = InstanceSupervisor::new(
        AgentPool::new(Arc::new(runtime)),
        allocator.clone(),
        SupervisorConfig::default(),
    );
    let environment = PersonaEnvironment::new(supervisor.clone(), Arc::new(roster.role_store()));
    let scheduler = TaskScheduler::new(
        environment,
        SchedulerConfig {
            limits: ResourceLimits {
                max_active_personas: 4,
                per_kind: roster.roster.per_kind_caps.clone(),
            },
            assignment_interval: Duration::from_millis(50),
            default_roles: roster.default_roles(),
            ..SchedulerConfig::default()
        },
    );

    let loop_scheduler = scheduler.clone();
    let loop_handle = tokio::spawn(async move { loop_scheduler.run_assignment_loop().await });

    // Schedule in dependency order, translating roster names to task ids.
    let mut ids_by_name: HashMap<String, String> = HashMap::new();
    for task in roster.topological_order().unwrap() {
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
        ids_by_name.insert(task.name.clone(), id);
    }

    for (name, id) in &ids_by_name {
        let task = scheduler
            .wait_for_task(id, Some(Duration::from_secs(30)))
            .await
            .unwrap_or_else(|e| panic!("task {name} did not finish: {e}"));
        assert_eq!(task.status, TaskStatus::Completed, "task {name} failed");
        let result = task.result.expect("completed task carries a result");
        assert!(result.starts_with("handled:"), "unexpected result: {result}");
    }

    // The singleton lead plus at most two workers.
    let usage = scheduler.resource_usage().await;
    assert!(usage.active_personas <= 3);
    assert_eq!(usage.pending_tasks, 0);
    assert_eq!(usage.running_tasks, 0);

    scheduler.stop();
    let _ = loop_handle.await;

    supervisor.cleanup().await.expect("cleanup succeeds");
    let remaining = allocator.list_allocated().unwrap();
    assert_eq!(remaining.len(), 1, "only the main working tree remains");
}
