//! Subprocess-backed agent runtime.
//!
//! Spawns a configurable agent binary in the instance's working directory,
//! writes the prompt to its stdin, and reads line-oriented JSON from stdout
//! until a terminal record arrives:
//!
//! ```text
//! {"type":"result","result":"<final text>"}
//! {"type":"error","message":"<what went wrong>"}
//! ```
//!
//! Non-JSON lines and unrecognised record types are skipped with a warning
//! so a chatty agent binary does not wedge the exchange.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::trait_def::{AgentRuntime, RuntimeError};

/// Configuration for [`ProcessRuntime`].
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Binary to execute (resolved via `$PATH` if not absolute).
    pub command: String,
    /// Extra arguments passed on every invocation.
    pub args: Vec<String>,
    /// Bound on each request/response exchange. Exceeding it kills the
    /// process and fails the invocation.
    pub response_timeout: Duration,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            command: "agent".to_string(),
            args: Vec::new(),
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Agent runtime that shells out to an external binary per invocation.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
}

impl ProcessRuntime {
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        Self { config }
    }

    /// Runtime for a bare command with default settings.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self::new(ProcessRuntimeConfig {
            command: command.into(),
            ..ProcessRuntimeConfig::default()
        })
    }

    pub fn config(&self) -> &ProcessRuntimeConfig {
        &self.config
    }

    /// Read stdout lines until a terminal record arrives.
    async fn read_result(child: &mut Child) -> Result<String, RuntimeError> {
        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::Protocol("agent process has no stdout pipe".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_record(trimmed) {
                        Ok(Some(Record::Result(text))) => return Ok(text),
                        Ok(Some(Record::Error(message))) => {
                            return Err(RuntimeError::Agent(message));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(line = trimmed, error = %e, "skipping malformed agent output line");
                        }
                    }
                }
                Ok(None) => {
                    return Err(RuntimeError::Protocol(
                        "agent process exited without a result".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(RuntimeError::Protocol(format!(
                        "error reading agent stdout: {e}"
                    )));
                }
            }
        }
    }
}

/// A terminal record parsed from one output line.
enum Record {
    Result(String),
    Error(String),
}

/// Parse one stdout line. `Ok(None)` means a valid but non-terminal record.
fn parse_record(line: &str) -> Result<Option<Record>, serde_json::Error> {
    let v: serde_json::Value = serde_json::from_str(line)?;
    let record_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match record_type {
        "result" => {
            let text = v
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string();
            Ok(Some(Record::Result(text)))
        }
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            Ok(Some(Record::Error(message)))
        }
        other => {
            debug!(record_type = other, "ignoring non-terminal agent record");
            Ok(None)
        }
    }
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(_status)) => {
            debug!("agent process exited after SIGTERM");
        }
        _ => {
            debug!("agent process did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn invoke(
        &self,
        prompt: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        // Merge, don't replace, the process environment.
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| RuntimeError::Spawn {
            message: format!(
                "failed to spawn agent binary '{}' -- is it installed and on PATH?",
                self.config.command
            ),
            source: e,
        })?;

        // Write the prompt and close stdin so the agent starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        // `None` means the cancellation token fired first. The select only
        // routes; `child` is handled once its borrows are released.
        let outcome = tokio::select! {
            result = tokio::time::timeout(
                self.config.response_timeout,
                Self::read_result(&mut child),
            ) => Some(result),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(Ok(Ok(text))) => {
                // Let the process wind down; reap it without blocking the
                // caller on a slow exit.
                let _ =
                    tokio::time::timeout(Duration::from_millis(100), child.wait()).await;
                Ok(text)
            }
            Some(Ok(Err(e))) => {
                terminate(&mut child).await;
                Err(e)
            }
            Some(Err(_elapsed)) => {
                terminate(&mut child).await;
                Err(RuntimeError::Timeout(self.config.response_timeout))
            }
            None => {
                terminate(&mut child).await;
                Err(RuntimeError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write an executable shell script that stands in for the agent binary.
    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn runtime_for(script: &Path, timeout: Duration) -> ProcessRuntime {
        ProcessRuntime::new(ProcessRuntimeConfig {
            command: script.to_str().unwrap().to_string(),
            args: Vec::new(),
            response_timeout: timeout,
        })
    }

    #[test]
    fn parse_result_record() {
        let line = r#"{"type":"result","result":"done"}"#;
        match parse_record(line).unwrap() {
            Some(Record::Result(text)) => assert_eq!(text, "done"),
            _ => panic!("expected a result record"),
        }
    }

    #[test]
    fn parse_error_record_nested_and_flat() {
        let nested = r#"{"type":"error","error":{"message":"rate limit"}}"#;
        match parse_record(nested).unwrap() {
            Some(Record::Error(message)) => assert_eq!(message, "rate limit"),
            _ => panic!("expected an error record"),
        }

        let flat = r#"{"type":"error","message":"broken"}"#;
        match parse_record(flat).unwrap() {
            Some(Record::Error(message)) => assert_eq!(message, "broken"),
            _ => panic!("expected an error record"),
        }
    }

    #[test]
    fn parse_non_terminal_record_is_skipped() {
        let line = r#"{"type":"progress","detail":"thinking"}"#;
        assert!(parse_record(line).unwrap().is_none());
    }

    #[test]
    fn parse_malformed_line_is_error() {
        assert!(parse_record("this is not json").is_err());
    }

    #[tokio::test]
    async fn invoke_returns_result_text() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_agent.sh",
            "echo '{\"type\":\"progress\",\"detail\":\"working\"}'\n\
             echo '{\"type\":\"result\",\"result\":\"all tests pass\"}'\n",
        );

        let runtime = runtime_for(&script, Duration::from_secs(10));
        let result = runtime
            .invoke("do the thing", tmp.path(), &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, "all tests pass");
    }

    #[tokio::test]
    async fn invoke_runs_in_working_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "pwd_agent.sh",
            "CWD=$(pwd)\necho \"{\\\"type\\\":\\\"result\\\",\\\"result\\\":\\\"$CWD\\\"}\"\n",
        );

        let work_dir = tmp.path().join("workdir");
        std::fs::create_dir(&work_dir).unwrap();

        let runtime = runtime_for(&script, Duration::from_secs(10));
        let result = runtime
            .invoke("where are you", &work_dir, &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();

        let canonical_work = work_dir.canonicalize().unwrap();
        let canonical_result = std::path::PathBuf::from(&result)
            .canonicalize()
            .unwrap_or_else(|_| std::path::PathBuf::from(&result));
        assert_eq!(canonical_result, canonical_work);
    }

    #[tokio::test]
    async fn invoke_receives_prompt_on_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "stdin_agent.sh",
            "PROMPT=$(cat)\necho \"{\\\"type\\\":\\\"result\\\",\\\"result\\\":\\\"$PROMPT\\\"}\"\n",
        );

        let runtime = runtime_for(&script, Duration::from_secs(10));
        let result = runtime
            .invoke("review the diff", tmp.path(), &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, "review the diff");
    }

    #[tokio::test]
    async fn invoke_injects_env_vars() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "env_agent.sh",
            "echo \"{\\\"type\\\":\\\"result\\\",\\\"result\\\":\\\"$DROVER_ROLE\\\"}\"\n",
        );

        let env = HashMap::from([("DROVER_ROLE".to_string(), "navigator".to_string())]);
        let runtime = runtime_for(&script, Duration::from_secs(10));
        let result = runtime
            .invoke("who are you", tmp.path(), &env, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, "navigator");
    }

    #[tokio::test]
    async fn invoke_surfaces_agent_error_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "err_agent.sh",
            "echo '{\"type\":\"error\",\"message\":\"context window exhausted\"}'\n",
        );

        let runtime = runtime_for(&script, Duration::from_secs(10));
        let err = runtime
            .invoke("too big", tmp.path(), &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RuntimeError::Agent(message) => assert_eq!(message, "context window exhausted"),
            other => panic!("expected Agent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_skips_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "noisy_agent.sh",
            "echo 'not json at all'\n\
             echo ''\n\
             echo '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        );

        let runtime = runtime_for(&script, Duration::from_secs(10));
        let result = runtime
            .invoke("go", tmp.path(), &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, "ok");
    }

    #[tokio::test]
    async fn invoke_without_result_is_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "silent_agent.sh", "exit 0\n");

        let runtime = runtime_for(&script, Duration::from_secs(10));
        let err = runtime
            .invoke("go", tmp.path(), &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }

    #[tokio::test]
    async fn invoke_times_out_and_kills() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy_agent.sh", "sleep 3600\n");

        let runtime = runtime_for(&script, Duration::from_millis(200));
        let start = std::time::Instant::now();
        let err = runtime
            .invoke("go", tmp.path(), &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(_)));
        // The grace period before SIGKILL is 5s; SIGTERM should do it.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn invoke_observes_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "cancel_agent.sh", "sleep 3600\n");

        let runtime = runtime_for(&script, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let err = runtime
            .invoke("go", tmp.path(), &HashMap::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
    }

    #[tokio::test]
    async fn invoke_missing_binary_is_spawn_error() {
        let runtime = ProcessRuntime::with_command("/nonexistent/path/to/agent");
        let err = runtime
            .invoke("go", Path::new("/tmp"), &HashMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RuntimeError::Spawn { message, .. } => {
                assert!(message.contains("/nonexistent/path/to/agent"));
            }
            other => panic!("expected Spawn error, got {other:?}"),
        }
    }
}
