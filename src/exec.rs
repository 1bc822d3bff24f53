use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::Invocation;

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub invocation: Invocation,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    LaunchFailed,
    Timeout,
    OutputTooLarge,
    NonZeroExit,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LaunchFailed => "launch_failed",
            Self::Timeout => "timeout",
            Self::OutputTooLarge => "output_too_large",
            Self::NonZeroExit => "non_zero_exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exited_normally: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub failure_reason: Option<FailureReason>,
    pub duration_ms: u64,
    /// Human readable description of the failure, if any.
    pub detail: Option<String>,
}

impl ExecutionResult {
    pub fn launch_failed(detail: impl Into<String>) -> Self {
        Self {
            exited_normally: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            failure_reason: Some(FailureReason::LaunchFailed),
            duration_ms: 0,
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exited_normally && self.failure_reason.is_none()
    }

    pub fn error_message(&self) -> Option<String> {
        let reason = self.failure_reason?;
        Some(match &self.detail {
            Some(detail) => detail.clone(),
            None => reason.as_str().to_owned(),
        })
    }
}

/// Runs one built invocation to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> ExecutionResult;
}

/// Spawns one child per request; a semaphore caps how many run at once.
pub struct ExecutionEngine {
    permits: Arc<Semaphore>,
}

impl ExecutionEngine {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl ProcessRunner for ExecutionEngine {
    async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return ExecutionResult::launch_failed("execution engine is shut down"),
        };
        run_invocation(request).await
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Interrupt {
    Timeout,
    OutputTooLarge,
}

async fn run_invocation(request: ExecutionRequest) -> ExecutionResult {
    let started = Instant::now();
    let timeout = Duration::from_millis(request.timeout_ms);
    let invocation = &request.invocation;

    let mut cmd = Command::new(invocation.program());
    cmd.args(invocation.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!("failed launching `{}`: {err}", invocation.program());
            return ExecutionResult::launch_failed(format!(
                "failed launching `{}`: {err}",
                invocation.program()
            ));
        }
    };

    let (tx, mut rx) = mpsc::channel::<(Stream, Vec<u8>)>(64);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut interrupt = None;

    // Drain both pipes until they close, the deadline fires or the ceiling
    // is crossed.
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some((stream, bytes)) => {
                    if stdout.len() + stderr.len() + bytes.len() > request.max_output_bytes {
                        let room = request
                            .max_output_bytes
                            .saturating_sub(stdout.len() + stderr.len());
                        let target = match stream {
                            Stream::Stdout => &mut stdout,
                            Stream::Stderr => &mut stderr,
                        };
                        target.extend_from_slice(&bytes[..room.min(bytes.len())]);
                        interrupt = Some(Interrupt::OutputTooLarge);
                        break;
                    }
                    match stream {
                        Stream::Stdout => stdout.extend_from_slice(&bytes),
                        Stream::Stderr => stderr.extend_from_slice(&bytes),
                    }
                }
                None => break,
            },
            _ = &mut deadline => {
                interrupt = Some(Interrupt::Timeout);
                break;
            }
        }
    }

    let status = if interrupt.is_none() {
        tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut deadline => {
                interrupt = Some(Interrupt::Timeout);
                None
            }
        }
    } else {
        None
    };

    if interrupt.is_some() {
        terminate(&mut child).await;
    }
    for reader in readers {
        reader.abort();
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();

    match (interrupt, status) {
        (Some(Interrupt::Timeout), _) => ExecutionResult {
            exited_normally: false,
            exit_code: None,
            stdout,
            stderr,
            failure_reason: Some(FailureReason::Timeout),
            duration_ms,
            detail: Some(format!("command timed out after {} ms", request.timeout_ms)),
        },
        (Some(Interrupt::OutputTooLarge), _) => ExecutionResult {
            exited_normally: false,
            exit_code: None,
            stdout,
            stderr,
            failure_reason: Some(FailureReason::OutputTooLarge),
            duration_ms,
            detail: Some(format!(
                "combined output exceeded {} bytes",
                request.max_output_bytes
            )),
        },
        (None, Some(Ok(status))) => {
            let exit_code = status.code();
            let exited_normally = status.success();
            debug!(?exit_code, duration_ms, "process exited");
            ExecutionResult {
                exited_normally,
                exit_code,
                stdout,
                stderr,
                failure_reason: (!exited_normally).then_some(FailureReason::NonZeroExit),
                duration_ms,
                detail: (!exited_normally).then(|| match exit_code {
                    Some(code) => format!("command exited with code {code}"),
                    None => "command terminated by signal".to_owned(),
                }),
            }
        }
        (None, Some(Err(err))) => ExecutionResult {
            duration_ms,
            ..ExecutionResult::launch_failed(format!(
                "failed waiting for `{}`: {err}",
                invocation.program()
            ))
        },
        (None, None) => ExecutionResult::launch_failed("process exit status unavailable"),
    }
}

fn spawn_reader<R>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, Vec<u8>)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Kills the whole process group so grandchildren holding the pipes die
/// with the direct child, then reaps it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was spawned as its own group leader.
        let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if result == -1 {
            debug!(
                "killpg({pid}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    if let Err(err) = child.start_kill() {
        debug!("start_kill failed: {err}");
    }
    if let Err(err) = child.wait().await {
        warn!("failed reaping terminated process: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn sh(script: &str, timeout_ms: u64, max_output_bytes: usize) -> ExecutionRequest {
        ExecutionRequest {
            invocation: Invocation::new("sh", vec!["-c".to_owned(), script.to_owned()]),
            timeout_ms,
            max_output_bytes,
        }
    }

    fn temp_marker(tag: &str) -> std::path::PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("linux-bash-gateway-exec-{tag}-{stamp}"))
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_status() {
        let engine = ExecutionEngine::new(2);
        let result = engine
            .run(sh("echo out; echo err >&2", 5_000, 1024))
            .await;
        assert!(result.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.failure_reason, None);
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_streams() {
        let engine = ExecutionEngine::new(2);
        let result = engine
            .run(sh("echo partial; echo broken >&2; exit 3", 5_000, 1024))
            .await;
        assert!(!result.exited_normally);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.failure_reason, Some(FailureReason::NonZeroExit));
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.stderr, "broken\n");
        assert_eq!(
            result.error_message().as_deref(),
            Some("command exited with code 3")
        );
    }

    #[tokio::test]
    async fn timeout_kills_the_process_tree() {
        let engine = ExecutionEngine::new(2);
        let marker = temp_marker("timeout");
        let script = format!("sleep 1; touch '{}'", marker.display());
        let started = Instant::now();
        let result = engine.run(sh(&script, 200, 1024)).await;
        assert_eq!(result.failure_reason, Some(FailureReason::Timeout));
        assert!(!result.exited_normally);
        assert!(started.elapsed() < Duration::from_millis(900));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists(), "timed out process kept running");
    }

    #[tokio::test]
    async fn output_ceiling_terminates_process() {
        let engine = ExecutionEngine::new(2);
        let result = engine
            .run(sh("head -c 65536 /dev/zero; sleep 5", 10_000, 4096))
            .await;
        assert_eq!(result.failure_reason, Some(FailureReason::OutputTooLarge));
        assert!(result.stdout.len() + result.stderr.len() <= 4096);
    }

    #[tokio::test]
    async fn combined_streams_count_toward_ceiling() {
        let engine = ExecutionEngine::new(2);
        let result = engine
            .run(sh("head -c 600 /dev/zero; head -c 600 /dev/zero >&2", 5_000, 1000))
            .await;
        assert_eq!(result.failure_reason, Some(FailureReason::OutputTooLarge));
    }

    #[tokio::test]
    async fn output_exactly_at_ceiling_is_accepted() {
        let engine = ExecutionEngine::new(2);
        let at_limit = engine.run(sh("head -c 1000 /dev/zero", 5_000, 1000)).await;
        assert!(at_limit.is_success(), "{:?}", at_limit.detail);
        assert_eq!(at_limit.stdout.len(), 1000);

        let over_limit = engine.run(sh("head -c 1001 /dev/zero", 5_000, 1000)).await;
        assert_eq!(over_limit.failure_reason, Some(FailureReason::OutputTooLarge));
        assert_eq!(over_limit.stdout.len(), 1000);
    }

    #[tokio::test]
    async fn missing_binary_reports_launch_failure() {
        let engine = ExecutionEngine::new(2);
        let result = engine
            .run(ExecutionRequest {
                invocation: Invocation::new("definitely-not-a-real-bridge-binary", vec![]),
                timeout_ms: 1_000,
                max_output_bytes: 1024,
            })
            .await;
        assert_eq!(result.failure_reason, Some(FailureReason::LaunchFailed));
        assert!(result
            .error_message()
            .is_some_and(|message| message.contains("definitely-not-a-real-bridge-binary")));
    }

    #[tokio::test]
    async fn concurrent_runs_are_bounded_but_all_complete() {
        let engine = Arc::new(ExecutionEngine::new(2));
        let runs = (0..6).map(|idx| {
            let engine = engine.clone();
            async move { engine.run(sh(&format!("echo {idx}"), 5_000, 1024)).await }
        });
        let results = futures_util::future::join_all(runs).await;
        for (idx, result) in results.iter().enumerate() {
            assert!(result.is_success());
            assert_eq!(result.stdout.trim(), idx.to_string());
        }
    }
}
