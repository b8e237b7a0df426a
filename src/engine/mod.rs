//! Execution Engine
//!
//! Spawns one child process per call, bounds it in time and output, and
//! reaps it. Nothing is shared between concurrent calls: each run owns its
//! [`ExecutionHandle`](process::ExecutionHandle).
//!
//! # Lifecycle
//!
//! 1. Build the child according to the [`ExecutionMode`] (shell or argv)
//! 2. Spawn it as the leader of a new process group
//! 3. Race exit against the timeout and the cancellation token
//! 4. On timeout or cancellation, SIGTERM the group, wait the grace period,
//!    then SIGKILL the group
//! 5. Drain output (bounded), classify, and report
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use execguard::engine::{CommandEngine, EngineConfig, ProcessEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = ProcessEngine::new(EngineConfig::default());
//!     let result = engine
//!         .run("echo hello", Duration::from_secs(10), CancellationToken::new())
//!         .await;
//!     assert!(result.success());
//!     assert_eq!(result.output, "hello\n");
//! }
//! ```

pub mod output;
pub mod process;
pub mod timeout;

pub use output::{OutputBuffer, DEFAULT_MAX_OUTPUT_BYTES};
pub use process::{ExecutionHandle, ResourceLimits, WaitOutcome};
pub use timeout::{TimeoutPolicy, DEFAULT_TIMEOUT_SECS, HARD_TIMEOUT_CEILING_SECS};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code reported when the timeout fired (same as `timeout(1)`)
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Exit code reported when a run was cancelled (128 + SIGKILL)
pub const EXIT_CODE_CANCELLED: i32 = 137;

/// Exit code reported when no process ran
pub const EXIT_CODE_NOT_RUN: i32 = -1;

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// How a command string becomes a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// `<program> -c <command>`; the shell interprets the string
    Shell { program: String },

    /// Shell-word split into argv; no shell involved
    Direct,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Shell {
            program: "/bin/sh".to_string(),
        }
    }
}

/// Classification of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Exited by itself (any exit code)
    Completed,

    /// Exceeded its timeout and was terminated
    TimedOut,

    /// Terminated by cancellation or by a signal
    Killed,

    /// No process could be started
    SpawnFailed,
}

impl ExecutionOutcome {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Killed => "killed",
            Self::SpawnFailed => "spawn_failed",
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one engine run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// How the run ended
    pub outcome: ExecutionOutcome,

    /// Process exit code, or a synthetic code (see the `EXIT_CODE_*` constants)
    pub exit_code: i32,

    /// Combined stdout+stderr, bounded
    pub output: String,

    /// Whether output was truncated
    pub truncated: bool,

    /// Failure description; `None` on success
    pub error: Option<String>,

    /// Spawn to exit (or forced kill), monotonic
    pub execution_time: Duration,
}

impl ExecutionResult {
    /// Exited by itself with code 0
    pub fn success(&self) -> bool {
        self.outcome == ExecutionOutcome::Completed && self.exit_code == 0
    }

    fn spawn_failed(reason: String, elapsed: Duration) -> Self {
        Self {
            outcome: ExecutionOutcome::SpawnFailed,
            exit_code: EXIT_CODE_NOT_RUN,
            output: String::new(),
            truncated: false,
            error: Some(reason),
            execution_time: elapsed,
        }
    }

    /// Human-readable one-line summary
    pub fn summary(&self) -> String {
        match self.outcome {
            ExecutionOutcome::Completed if self.success() => format!(
                "Success ({:.3}s, {} bytes output)",
                self.execution_time.as_secs_f64(),
                self.output.len()
            ),
            _ => format!(
                "{} (exit code: {}, {:.3}s): {}",
                self.outcome,
                self.exit_code,
                self.execution_time.as_secs_f64(),
                self.error.as_deref().unwrap_or("")
            ),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shell or direct argv execution
    pub mode: ExecutionMode,

    /// Output cap in bytes (default: 1 MiB)
    pub max_output_bytes: usize,

    /// Delay between SIGTERM and SIGKILL (default: 2s)
    pub kill_grace_period: Duration,

    /// Working directory for children (default: inherited)
    pub working_dir: Option<PathBuf>,

    /// Inherit the service's whole environment instead of the passthrough list
    pub inherit_env: bool,

    /// Variables copied from the service environment when not inheriting
    pub env_passthrough: Vec<String>,

    /// rlimits applied before exec
    pub limits: ResourceLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            kill_grace_period: DEFAULT_KILL_GRACE,
            working_dir: None,
            inherit_env: false,
            env_passthrough: default_env_passthrough(),
            limits: ResourceLimits::default(),
        }
    }
}

pub fn default_env_passthrough() -> Vec<String> {
    ["PATH", "HOME", "LANG", "LC_ALL", "TZ", "USER"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl EngineConfig {
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_kill_grace_period(mut self, grace: Duration) -> Self {
        self.kill_grace_period = grace;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Runs commands to completion
///
/// The service depends on this trait rather than on [`ProcessEngine`], so
/// tests can observe (or forbid) engine invocations.
#[async_trait]
pub trait CommandEngine: Send + Sync {
    /// Run `command`, bounded by `timeout`; cancelling `cancel` terminates it
    /// through the same path as a timeout.
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionResult;
}

/// Engine backed by real OS processes
#[derive(Debug, Clone, Default)]
pub struct ProcessEngine {
    config: EngineConfig,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn build_command(&self, command: &str) -> Result<Command, String> {
        let mut cmd = match &self.config.mode {
            ExecutionMode::Shell { program } => {
                let mut cmd = Command::new(program);
                cmd.arg("-c").arg(command);
                cmd
            }
            ExecutionMode::Direct => {
                let argv = shell_words::split(command)
                    .map_err(|e| format!("failed to parse command: {}", e))?;
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| "failed to parse command: no program given".to_string())?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        if !self.config.inherit_env {
            cmd.env_clear();
            for key in &self.config.env_passthrough {
                if let Some(value) = std::env::var_os(key) {
                    cmd.env(key, value);
                }
            }
        }

        cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        process::apply_resource_limits(&mut cmd, &self.config.limits);

        Ok(cmd)
    }
}

#[async_trait]
impl CommandEngine for ProcessEngine {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let start = Instant::now();
        info!(
            "Executing: {:?} (timeout: {:?})",
            preview(command),
            timeout
        );

        let mut cmd = match self.build_command(command) {
            Ok(cmd) => cmd,
            Err(reason) => {
                warn!("Command could not be prepared: {}", reason);
                return ExecutionResult::spawn_failed(reason, start.elapsed());
            }
        };

        let mut handle =
            match ExecutionHandle::spawn(&mut cmd, self.config.max_output_bytes, cancel) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Failed to spawn command: {}", e);
                    return ExecutionResult::spawn_failed(
                        format!("failed to spawn command: {}", e),
                        start.elapsed(),
                    );
                }
            };
        debug!("Spawned process group {:?}", handle.pid());

        let grace = self.config.kill_grace_period;
        let (outcome, exit_code, error) = match handle.wait(timeout).await {
            WaitOutcome::Exited(status) => {
                handle.sweep();
                classify_exit(status)
            }
            WaitOutcome::TimedOut => {
                warn!("Command timed out after {:?}, terminating", timeout);
                handle.terminate(grace).await;
                (
                    ExecutionOutcome::TimedOut,
                    EXIT_CODE_TIMEOUT,
                    Some(format!(
                        "timeout: command exceeded {:?} limit and was killed",
                        timeout
                    )),
                )
            }
            WaitOutcome::Cancelled => {
                warn!("Command cancelled, terminating");
                handle.terminate(grace).await;
                (
                    ExecutionOutcome::Killed,
                    EXIT_CODE_CANCELLED,
                    Some("command was cancelled".to_string()),
                )
            }
            WaitOutcome::WaitFailed(e) => {
                warn!("Lost track of command: {}", e);
                handle.terminate(grace).await;
                (
                    ExecutionOutcome::Killed,
                    EXIT_CODE_NOT_RUN,
                    Some(format!("lost track of process: {}", e)),
                )
            }
        };

        let execution_time = handle.elapsed();
        let (output, truncated) = handle.collect_output().await;
        if truncated {
            debug!(
                "Output truncated at {} bytes",
                self.config.max_output_bytes
            );
        }

        let result = ExecutionResult {
            outcome,
            exit_code,
            output,
            truncated,
            error,
            execution_time,
        };
        info!("Command finished: {}", result.summary());
        result
    }
}

/// Map an exit status onto outcome, exit code and error text
fn classify_exit(status: ExitStatus) -> (ExecutionOutcome, i32, Option<String>) {
    if let Some(code) = status.code() {
        let error = (code != 0).then(|| format!("command exited with code {}", code));
        return (ExecutionOutcome::Completed, code, error);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (
                ExecutionOutcome::Killed,
                128 + signal,
                Some(format!("terminated by signal {}", signal)),
            );
        }
    }

    (
        ExecutionOutcome::Killed,
        EXIT_CODE_NOT_RUN,
        Some("terminated without an exit code".to_string()),
    )
}

/// First 64 characters, for logs
fn preview(command: &str) -> String {
    if command.chars().count() > 64 {
        let head: String = command.chars().take(64).collect();
        format!("{}...", head)
    } else {
        command.to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn run(engine: &ProcessEngine, command: &str, timeout_secs: u64) -> ExecutionResult {
        engine
            .run(
                command,
                Duration::from_secs(timeout_secs),
                CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let engine = ProcessEngine::default();
        let result = run(&engine, "echo hello", 10).await;

        assert!(result.success());
        assert_eq!(result.outcome, ExecutionOutcome::Completed);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hello\n");
        assert!(result.error.is_none());
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let engine = ProcessEngine::default();
        let result = run(&engine, "echo partial; exit 3", 10).await;

        assert!(!result.success());
        assert_eq!(result.outcome, ExecutionOutcome::Completed);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "partial\n");
        assert_eq!(result.error.as_deref(), Some("command exited with code 3"));
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let engine = ProcessEngine::default();
        let result = run(&engine, "echo oops 1>&2", 10).await;

        assert!(result.success());
        assert_eq!(result.output, "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_terminates_within_grace() {
        let engine = ProcessEngine::new(
            EngineConfig::default().with_kill_grace_period(Duration::from_millis(500)),
        );
        let started = Instant::now();
        let result = run(&engine, "sleep 30", 1).await;

        assert!(!result.success());
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
        assert_eq!(result.exit_code, EXIT_CODE_TIMEOUT);
        assert!(result.error.as_deref().unwrap().contains("timeout"));
        // timeout + grace + drain slack
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.execution_time >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let engine = ProcessEngine::new(
            EngineConfig::default().with_kill_grace_period(Duration::from_millis(200)),
        );
        let result = run(&engine, "echo before; sleep 30", 1).await;

        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
        assert_eq!(result.output, "before\n");
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let engine = ProcessEngine::new(EngineConfig::default().with_max_output_bytes(1000));
        let result = run(&engine, "seq 1 100000", 30).await;

        assert!(result.success());
        assert!(result.truncated);
        assert!(result.output.contains("[output truncated:"));
        assert!(result.output.len() < 1000 + 64);
    }

    #[tokio::test]
    async fn test_cancellation_kills() {
        let engine = ProcessEngine::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = engine
            .run("sleep 30", Duration::from_secs(30), cancel)
            .await;

        assert_eq!(result.outcome, ExecutionOutcome::Killed);
        assert_eq!(result.exit_code, EXIT_CODE_CANCELLED);
        assert!(result.execution_time < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_signal_death_is_killed() {
        let engine = ProcessEngine::default();
        let result = run(&engine, "kill -9 $$", 10).await;

        assert_eq!(result.outcome, ExecutionOutcome::Killed);
        assert_eq!(result.exit_code, 137);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_direct_mode_argv() {
        let engine = ProcessEngine::new(EngineConfig::default().with_mode(ExecutionMode::Direct));
        let result = run(&engine, "echo 'a  b' $HOME", 10).await;

        // No shell: quotes are honoured, variables are not expanded
        assert!(result.success());
        assert_eq!(result.output, "a  b $HOME\n");
    }

    #[tokio::test]
    async fn test_direct_mode_unbalanced_quotes() {
        let engine = ProcessEngine::new(EngineConfig::default().with_mode(ExecutionMode::Direct));
        let result = run(&engine, "echo 'oops", 10).await;

        assert_eq!(result.outcome, ExecutionOutcome::SpawnFailed);
        assert_eq!(result.exit_code, EXIT_CODE_NOT_RUN);
        assert!(result.error.unwrap().contains("failed to parse"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let engine = ProcessEngine::new(EngineConfig::default().with_mode(ExecutionMode::Direct));
        let result = run(&engine, "this-command-does-not-exist-12345", 10).await;

        assert_eq!(result.outcome, ExecutionOutcome::SpawnFailed);
        assert_eq!(result.exit_code, EXIT_CODE_NOT_RUN);
        assert!(result.error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_working_directory() {
        let engine = ProcessEngine::new(EngineConfig::default().with_working_dir("/tmp"));
        let result = run(&engine, "pwd", 10).await;

        assert!(result.success());
        assert!(result.output.contains("tmp"));
    }

    #[tokio::test]
    async fn test_environment_is_filtered() {
        std::env::set_var("EXECGUARD_TEST_SECRET", "hunter2");
        let engine = ProcessEngine::default();
        let result = run(&engine, "echo \"[$EXECGUARD_TEST_SECRET]\"", 10).await;

        assert_eq!(result.output, "[]\n");
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_mix_output() {
        let engine = Arc::new(ProcessEngine::default());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let command = format!("for n in 1 2 3; do echo job-{}; sleep 0.05; done", i);
                    (i, run(&engine, &command, 10).await)
                })
            })
            .collect();

        for task in tasks {
            let (i, result) = task.await.unwrap();
            assert!(result.success());
            let expected = format!("job-{}\n", i).repeat(3);
            assert_eq!(result.output, expected);
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_descendants() {
        let engine = ProcessEngine::new(
            EngineConfig::default().with_kill_grace_period(Duration::from_millis(200)),
        );
        let result = run(&engine, "sleep 60 & echo $!; wait", 1).await;
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);

        let pid: i32 = result.output.trim().parse().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Gone, or a zombie waiting for init to reap it
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid));
        if let Ok(stat) = stat {
            let state = stat.rsplit(')').next().unwrap().split_whitespace().next();
            assert_eq!(state, Some("Z"), "descendant {} still running", pid);
        }
    }

    #[test]
    fn test_result_summary() {
        let ok = ExecutionResult {
            outcome: ExecutionOutcome::Completed,
            exit_code: 0,
            output: "x".to_string(),
            truncated: false,
            error: None,
            execution_time: Duration::from_millis(5),
        };
        assert!(ok.summary().starts_with("Success"));

        let failed = ExecutionResult::spawn_failed("boom".to_string(), Duration::ZERO);
        assert!(failed.summary().contains("spawn_failed"));
        assert!(failed.summary().contains("boom"));
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("echo"), "echo");
        let long = "x".repeat(100);
        assert_eq!(preview(&long).len(), 67);
    }
}
