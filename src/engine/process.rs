//! Child Process Lifecycle
//!
//! An [`ExecutionHandle`] owns one child for the lifetime of one request:
//! the process, its start time, the cancellation token and the output buffer.
//! The child leads its own process group so termination reaches every
//! descendant, not just the immediate child.

use super::output::OutputBuffer;
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How long output readers may keep draining after the child is gone.
/// Bounds the call when a stray descendant still holds the pipes.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Optional rlimits applied in the child before exec (Linux only)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// RLIMIT_CPU in seconds
    pub cpu_secs: Option<u64>,

    /// RLIMIT_AS in bytes
    pub address_space_bytes: Option<u64>,

    /// RLIMIT_NPROC (counted per user, not per request)
    pub max_processes: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.cpu_secs.is_none() && self.address_space_bytes.is_none() && self.max_processes.is_none()
    }
}

/// Install the rlimit hook on a command
#[cfg(target_os = "linux")]
pub fn apply_resource_limits(command: &mut Command, limits: &ResourceLimits) {
    if limits.is_empty() {
        return;
    }

    let limits = limits.clone();
    // SAFETY: the closure only calls setrlimit(2), which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            use nix::sys::resource::{setrlimit, Resource};

            if let Some(cpu) = limits.cpu_secs {
                setrlimit(Resource::RLIMIT_CPU, cpu, cpu).map_err(std::io::Error::from)?;
            }
            if let Some(bytes) = limits.address_space_bytes {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(std::io::Error::from)?;
            }
            if let Some(procs) = limits.max_processes {
                setrlimit(Resource::RLIMIT_NPROC, procs, procs).map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub fn apply_resource_limits(_command: &mut Command, limits: &ResourceLimits) {
    if !limits.is_empty() {
        warn!("Resource limits are only enforced on Linux; ignoring {:?}", limits);
    }
}

/// How the exit/timeout/cancel race ended
#[derive(Debug)]
pub enum WaitOutcome {
    /// The process exited by itself
    Exited(ExitStatus),

    /// The timeout fired first
    TimedOut,

    /// The cancellation token fired first
    Cancelled,

    /// Waiting on the child failed
    WaitFailed(std::io::Error),
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Engine-owned state for one running command
pub struct ExecutionHandle {
    child: Child,
    pgid: Option<i32>,
    started: Instant,
    cancel: CancellationToken,
    output: Arc<Mutex<OutputBuffer>>,
    readers: Vec<JoinHandle<()>>,
    reaped: bool,
}

impl ExecutionHandle {
    /// Spawn the command and start draining its output
    ///
    /// The command must already be configured with piped stdout/stderr and,
    /// on Unix, `process_group(0)`.
    pub fn spawn(
        command: &mut Command,
        max_output_bytes: usize,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let mut child = command.spawn()?;
        let started = Instant::now();
        let pgid = child.id().map(|pid| pid as i32);

        let output = Arc::new(Mutex::new(OutputBuffer::new(max_output_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&output)));
        }

        Ok(Self {
            child,
            pgid,
            started,
            cancel,
            output,
            readers,
            reaped: false,
        })
    }

    /// Process id of the group leader, if still known
    pub fn pid(&self) -> Option<i32> {
        self.pgid
    }

    /// Time since spawn (monotonic)
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Race process exit against the timeout and the cancellation token
    pub async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        let outcome = tokio::select! {
            status = self.child.wait() => match status {
                Ok(status) => WaitOutcome::Exited(status),
                Err(e) => WaitOutcome::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            _ = self.cancel.cancelled() => WaitOutcome::Cancelled,
        };

        if matches!(outcome, WaitOutcome::Exited(_)) {
            self.reaped = true;
        }
        outcome
    }

    /// Terminate the whole group: SIGTERM, wait `grace`, then SIGKILL.
    ///
    /// Always reaps the leader. Returns its exit status when one was observed.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.signal_group(GroupSignal::Terminate);

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Failed to wait for terminated process: {}", e);
                None
            }
            Err(_) => {
                debug!("Grace period of {:?} elapsed, force-killing", grace);
                None
            }
        };

        // Stragglers that ignored SIGTERM, or outlived the leader
        self.signal_group(GroupSignal::Kill);

        let status = match status {
            Some(status) => Some(status),
            None => self.child.wait().await.ok(),
        };
        self.reaped = true;
        status
    }

    /// Kill anything left in the group after the leader exited on its own
    pub fn sweep(&mut self) {
        self.signal_group(GroupSignal::Kill);
    }

    /// Wait (bounded) for the readers to drain, then render the output.
    ///
    /// Returns the captured text and whether it was truncated.
    pub async fn collect_output(&mut self) -> (String, bool) {
        let drain = async {
            for reader in self.readers.iter_mut() {
                let _ = reader.await;
            }
        };

        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Output pipes still open after exit, abandoning readers");
            for reader in &self.readers {
                reader.abort();
            }
        }

        let buffer = self.output.lock().await;
        (buffer.render(), buffer.is_truncated())
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: GroupSignal) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return;
        };

        let sig = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };

        match killpg(Pid::from_raw(pgid), sig) {
            Ok(()) => debug!("Sent {:?} to process group {}", sig, pgid),
            // Group already empty
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to signal process group {}: {}", pgid, e),
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: GroupSignal) {
        if let Err(e) = self.child.start_kill() {
            debug!("Failed to kill child: {}", e);
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if !self.reaped {
            // Request abandoned mid-flight
            self.signal_group(GroupSignal::Kill);
            let _ = self.child.start_kill();
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(mut reader: R, output: Arc<Mutex<OutputBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => output.lock().await.push(&chunk[..n]),
                Err(e) => {
                    debug!("Output read failed: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        command
    }

    #[tokio::test]
    async fn test_wait_exits() {
        let mut handle =
            ExecutionHandle::spawn(&mut shell("echo out"), 1024, CancellationToken::new())
                .unwrap();

        let outcome = handle.wait(Duration::from_secs(5)).await;
        assert!(matches!(outcome, WaitOutcome::Exited(s) if s.success()));

        let (output, truncated) = handle.collect_output().await;
        assert_eq!(output, "out\n");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_terminates() {
        let mut handle =
            ExecutionHandle::spawn(&mut shell("sleep 30"), 1024, CancellationToken::new())
                .unwrap();

        let outcome = handle.wait(Duration::from_millis(200)).await;
        assert!(matches!(outcome, WaitOutcome::TimedOut));

        let status = handle.terminate(Duration::from_secs(1)).await;
        assert!(status.is_some());
        assert!(handle.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let mut handle = ExecutionHandle::spawn(
            &mut shell("trap '' TERM; sleep 30"),
            1024,
            CancellationToken::new(),
        )
        .unwrap();

        assert!(matches!(
            handle.wait(Duration::from_millis(200)).await,
            WaitOutcome::TimedOut
        ));

        let started = Instant::now();
        let status = handle.terminate(Duration::from_millis(300)).await;
        assert!(status.is_some());
        // Grace period plus slack, never the full sleep
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_wins_race() {
        let cancel = CancellationToken::new();
        let mut handle = ExecutionHandle::spawn(&mut shell("sleep 30"), 1024, cancel.clone())
            .unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = handle.wait(Duration::from_secs(30)).await;
        assert!(matches!(outcome, WaitOutcome::Cancelled));
        handle.terminate(Duration::from_millis(500)).await;
    }

    #[test]
    fn test_resource_limits_empty() {
        assert!(ResourceLimits::default().is_empty());
        let limits = ResourceLimits {
            cpu_secs: Some(5),
            ..Default::default()
        };
        assert!(!limits.is_empty());
    }
}
