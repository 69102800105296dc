//! Shared test fixtures: a scratch git repository and scriptable agent
//! runtimes used by the supervisor, persona and scheduler tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRuntime, RuntimeError};

/// Create a temporary git repository with an initial commit.
/// Returns the TempDir (must be held alive) and the repo path.
pub(crate) fn temp_repo() -> (TempDir, PathBuf) {
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

type ReplyFn = Box<dyn Fn(&str) -> Result<String, RuntimeError> + Send + Sync>;

/// A runtime whose replies are driven by a closure over the prompt.
/// Records every prompt it sees.
pub(crate) struct ScriptedRuntime {
    reply: ReplyFn,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    pub(crate) fn new(
        reply: impl Fn(&str) -> Result<String, RuntimeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Acknowledges every prompt.
    pub(crate) fn echo() -> Self {
        Self::new(|prompt| Ok(format!("ack: {prompt}")))
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        prompt: &str,
        _working_dir: &Path,
        _env: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        (self.reply)(prompt)
    }
}

/// A runtime that fails its first `failures` invocations, then succeeds.
/// Used to exercise the restart path.
pub(crate) struct FlakyRuntime {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyRuntime {
    pub(crate) fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every invocation.
    pub(crate) fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }
}

#[async_trait]
impl AgentRuntime for FlakyRuntime {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn invoke(
        &self,
        prompt: &str,
        _working_dir: &Path,
        _env: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(RuntimeError::Agent(format!("flaky failure #{}", call + 1)))
        } else {
            Ok(format!("recovered: {prompt}"))
        }
    }
}
