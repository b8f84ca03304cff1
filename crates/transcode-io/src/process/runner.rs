//! Short-lived helper processes (probes, version checks) run to completion.
//!
//! Standard output and standard error are merged into one consumer. The
//! result always comes back; spawn failures and timeouts are carried in it.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use super::CommandLine;
use crate::consumer::{ConsumedOutput, OutputConsumer};
use crate::error::TranscodeError;
use crate::registry::{ManagedChild, ProcessRegistry, RegistrationId};

/// Exit code of a process that never ran or whose code is unknown.
pub const UNKNOWN_EXIT_CODE: i32 = i32::MIN;

#[derive(Debug)]
pub struct ProcessRunResult<T> {
    /// `None` if the process could not be started
    pub output: Option<T>,
    pub exit_code: i32,
    pub error: Option<TranscodeError>,
}

impl<T> ProcessRunResult<T> {
    fn failed(error: TranscodeError) -> Self {
        Self {
            output: None,
            exit_code: UNKNOWN_EXIT_CODE,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProcessRunResult<U> {
        ProcessRunResult {
            output: self.output.map(f),
            exit_code: self.exit_code,
            error: self.error,
        }
    }
}

/// Registry view of a one-shot process, addressed by pid.
struct SpawnedChild {
    label: String,
    pid: Option<u32>,
    exited: AtomicBool,
    terminated: AtomicBool,
}

impl ManagedChild for SpawnedChild {
    fn label(&self) -> &str {
        &self.label
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) {
        if !self.is_alive() {
            return;
        }
        self.terminated.store(true, Ordering::Release);
        if let Some(pid) = self.pid {
            if let Err(e) = process_utils::terminate(pid) {
                debug!(process = %self.label, pid, error = %e, "Terminate failed");
            }
        }
    }

    fn kill(&self) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.pid {
            if let Err(e) = process_utils::kill(pid) {
                debug!(process = %self.label, pid, error = %e, "Kill failed");
            }
        }
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }
}

/// Removes the registration when the run ends, however it ends.
struct Registration<'a> {
    registry: &'a ProcessRegistry,
    id: RegistrationId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove_process(self.id);
    }
}

/// Run `command` to completion, feeding its merged output to `consumer`.
///
/// With `timeout_ms > 0` the process is registered with `registry` and
/// terminated once the timeout passes.
pub async fn run_process(
    registry: &ProcessRegistry,
    command: &CommandLine,
    consumer: OutputConsumer,
    timeout_ms: u64,
    terminate_timeout_ms: u64,
) -> ProcessRunResult<ConsumedOutput> {
    let label = command.label();
    let mut cmd = command.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let e = TranscodeError::spawn(label, e);
            warn!(command = %command, error = %e, "Cannot run process");
            return ProcessRunResult::failed(e);
        }
    };
    debug!(process = %label, pid = child.id(), command = %command, "Running process");

    let managed = Arc::new(SpawnedChild {
        label: label.clone(),
        pid: child.id(),
        exited: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
    });
    let registration = (timeout_ms > 0).then(|| Registration {
        registry,
        id: registry.add_process(
            managed.clone(),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(terminate_timeout_ms),
        ),
    });

    let stdout = futures::stream::iter(child.stdout.take()).flat_map(ReaderStream::new);
    let stderr = futures::stream::iter(child.stderr.take()).flat_map(ReaderStream::new);
    let merged = StreamReader::new(futures::stream::select(stdout, stderr));

    let wait = async {
        let status = child.wait().await;
        // reaped: the pid is no longer ours to signal
        managed.exited.store(true, Ordering::Release);
        status
    };
    let (output, status) = tokio::join!(consumer.consume(merged, &label), wait);
    drop(registration);

    let timed_out = managed.terminated.load(Ordering::Acquire);
    match status {
        Ok(status) => {
            let exit_code = status.code().unwrap_or(UNKNOWN_EXIT_CODE);
            if exit_code != 0 {
                debug!(process = %label, exit_code, "Process exited with a non-zero code");
            }
            ProcessRunResult {
                output: Some(output),
                exit_code,
                error: timed_out.then(|| TranscodeError::Timeout {
                    name: label,
                    timeout_ms,
                }),
            }
        }
        Err(e) => ProcessRunResult {
            output: Some(output),
            exit_code: UNKNOWN_EXIT_CODE,
            error: Some(e.into()),
        },
    }
}

/// [`run_process`] on a background task.
pub fn spawn_process(
    registry: Arc<ProcessRegistry>,
    command: CommandLine,
    consumer: OutputConsumer,
    timeout_ms: u64,
    terminate_timeout_ms: u64,
) -> JoinHandle<ProcessRunResult<ConsumedOutput>> {
    tokio::spawn(async move {
        run_process(&registry, &command, consumer, timeout_ms, terminate_timeout_ms).await
    })
}

pub async fn run_process_lines(
    registry: &ProcessRegistry,
    command: &CommandLine,
    timeout_ms: u64,
    terminate_timeout_ms: u64,
) -> ProcessRunResult<Vec<String>> {
    run_process(registry, command, OutputConsumer::text(), timeout_ms, terminate_timeout_ms)
        .await
        .map(ConsumedOutput::into_lines)
}

pub async fn run_process_bytes(
    registry: &ProcessRegistry,
    command: &CommandLine,
    timeout_ms: u64,
    terminate_timeout_ms: u64,
) -> ProcessRunResult<Bytes> {
    run_process(registry, command, OutputConsumer::Bytes, timeout_ms, terminate_timeout_ms)
        .await
        .map(ConsumedOutput::into_bytes)
}

pub async fn run_process_discard(
    registry: &ProcessRegistry,
    command: &CommandLine,
    timeout_ms: u64,
    terminate_timeout_ms: u64,
) -> ProcessRunResult<()> {
    run_process(
        registry,
        command,
        OutputConsumer::Discard { log: true },
        timeout_ms,
        terminate_timeout_ms,
    )
    .await
    .map(|_| ())
}
