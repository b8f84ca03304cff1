use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{CommandLine, ProcessState};
use crate::buffer::{BufferReader, RingBuffer, StopTarget};
use crate::params::OutputParams;
use crate::pipe::PipeTransport;
use crate::platform::Platform;
use crate::registry::{ManagedChild, ProcessRegistry, RegistrationId};

/// One launched external process.
///
/// Shared between the supervisor's waiter task, the registry, the buffer it
/// feeds and whoever streams from it. Stopping is idempotent: however many
/// callers race on [`stop_process`](Self::stop_process), exactly one of them
/// does the work.
pub struct ProcessHandle {
    name: String,
    command: CommandLine,
    params: OutputParams,
    platform: Arc<dyn Platform>,
    registry: Arc<ProcessRegistry>,
    buffer: Option<Arc<RingBuffer>>,
    pipes: Vec<Arc<dyn PipeTransport>>,
    terminate_timeout: Duration,

    pid: Mutex<Option<u32>>,
    state: Mutex<ProcessState>,
    exit_code: Mutex<Option<i32>>,
    error: Mutex<Option<String>>,
    stderr_lines: Mutex<Vec<String>>,
    stdout_lines: Mutex<Vec<String>>,
    attached: Mutex<Vec<Arc<ProcessHandle>>>,
    registration: Mutex<Option<RegistrationId>>,

    destroyed: AtomicBool,
    /// The OS process is gone; its pid may already belong to someone else
    exited: AtomicBool,
    ready_to_stop: AtomicBool,
    failed: AtomicBool,

    /// Cancelled by `stop_process`: terminate, then kill after the grace period
    stop: CancellationToken,
    /// Cancelled to kill without grace
    kill: CancellationToken,
    /// Cancelled once the process has exited (or never started)
    finished: CancellationToken,
}

impl ProcessHandle {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        name: String,
        command: CommandLine,
        params: OutputParams,
        platform: Arc<dyn Platform>,
        registry: Arc<ProcessRegistry>,
        buffer: Option<Arc<RingBuffer>>,
        pipes: Vec<Arc<dyn PipeTransport>>,
        terminate_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            command,
            params,
            platform,
            registry,
            buffer,
            pipes,
            terminate_timeout,
            pid: Mutex::new(None),
            state: Mutex::new(ProcessState::Created),
            exit_code: Mutex::new(None),
            error: Mutex::new(None),
            stderr_lines: Mutex::new(Vec::new()),
            stdout_lines: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            registration: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            ready_to_stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn params(&self) -> &OutputParams {
        &self.params
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.params.working_dir.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// `None` while running, when killed by a signal, or when never started.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Why the process failed to start or was cut short.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn is_success(&self) -> bool {
        !self.failed.load(Ordering::Acquire) && self.exit_code() == Some(0)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Whether the process has finished, output drained and accounted for.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Whether the OS process has exited. Output may still be draining.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn is_ready_to_stop(&self) -> bool {
        self.ready_to_stop.load(Ordering::Acquire)
    }

    pub fn set_ready_to_stop(&self, ready: bool) {
        self.ready_to_stop.store(ready, Ordering::Release);
    }

    /// Captured standard error lines.
    pub fn results(&self) -> Vec<String> {
        self.stderr_lines.lock().clone()
    }

    /// Captured standard output lines, for processes launched with `log`.
    pub fn other_results(&self) -> Vec<String> {
        self.stdout_lines.lock().clone()
    }

    pub fn buffer(&self) -> Option<&Arc<RingBuffer>> {
        self.buffer.as_ref()
    }

    /// A reader over the buffered output starting at byte `seek_offset`.
    ///
    /// `None` when the output does not go to a buffer, when the buffer is
    /// already released, or when the connection policy refuses the reader.
    pub fn get_input_stream(&self, seek_offset: u64) -> Option<BufferReader> {
        let buffer = self.buffer.as_ref()?;
        if buffer.is_released() {
            return None;
        }
        buffer.attach_reader(seek_offset)
    }

    /// Stop `child` together with this process.
    pub fn attach_process(&self, child: Arc<ProcessHandle>) {
        debug!(process = %self.name, child = %child.name, "Attached dependent process");
        self.attached.lock().push(child);
    }

    /// Wait for the process to end. Returns its exit code.
    pub async fn wait(&self) -> Option<i32> {
        self.finished.cancelled().await;
        self.exit_code()
    }

    /// Stop the process, everything attached to it, and release its buffer.
    ///
    /// Once the process has exited no signal is sent, and the buffer and
    /// pipes are left for the waiter to drain. Returns `false` if it was already stopped.
    pub fn stop_process(&self) -> bool {
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!(process = %self.name, pid = self.pid(), "Stopping process");
        {
            let mut state = self.state.lock();
            if *state != ProcessState::Completed {
                *state = ProcessState::Destroyed;
            }
        }
        let exited = self.has_exited();
        if !exited {
            if let Some(pid) = self.pid() {
                if let Err(e) = self.platform.terminate(pid) {
                    trace!(process = %self.name, pid, error = %e, "Terminate failed");
                }
            }
        }
        self.stop.cancel();
        self.stop_attached();
        // after exit the waiter drains, closes and releases everything
        if !exited {
            if let Some(buffer) = &self.buffer {
                buffer.reset();
            }
            self.close_pipes();
        }
        self.unregister();
        true
    }

    pub(super) fn stop_attached(&self) {
        let attached = std::mem::take(&mut *self.attached.lock());
        for child in attached {
            if child.stop_process() {
                trace!(process = %self.name, child = %child.name, "Stopped dependent process");
            }
        }
    }

    pub(super) fn close_pipes(&self) {
        for pipe in &self.pipes {
            pipe.close();
        }
    }

    pub(super) fn set_registration(&self, id: RegistrationId) {
        *self.registration.lock() = Some(id);
    }

    pub(super) fn unregister(&self) {
        if let Some(id) = self.registration.lock().take() {
            self.registry.remove_process(id);
        }
    }

    /// Called as soon as the process is reaped: the registry deadline no
    /// longer applies and the pid must not be signalled again.
    pub(super) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
        self.unregister();
    }

    pub(super) fn set_running(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
        let mut state = self.state.lock();
        if *state == ProcessState::Created {
            *state = ProcessState::Running;
        }
    }

    pub(super) fn record_error(&self, error: impl fmt::Display) {
        self.failed.store(true, Ordering::Release);
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }

    pub(super) fn record_output(&self, stderr: Vec<String>, stdout: Vec<String>) {
        self.stderr_lines.lock().extend(stderr);
        self.stdout_lines.lock().extend(stdout);
    }

    /// Exit bookkeeping. Called once, by whoever observed the end.
    pub(super) fn finish(&self, exit_code: Option<i32>) {
        self.exited.store(true, Ordering::Release);
        *self.exit_code.lock() = exit_code;
        {
            let mut state = self.state.lock();
            if *state != ProcessState::Destroyed {
                *state = ProcessState::Completed;
            }
        }
        self.finished.cancel();
    }

    pub(super) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(super) fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }

    pub(super) fn finished_token(&self) -> &CancellationToken {
        &self.finished
    }

    pub(super) fn terminate_timeout(&self) -> Duration {
        self.terminate_timeout
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl StopTarget for ProcessHandle {
    fn label(&self) -> &str {
        &self.name
    }

    fn set_ready_to_stop(&self, ready: bool) {
        ProcessHandle::set_ready_to_stop(self, ready);
    }

    fn is_ready_to_stop(&self) -> bool {
        ProcessHandle::is_ready_to_stop(self)
    }

    fn is_destroyed(&self) -> bool {
        ProcessHandle::is_destroyed(self)
    }

    fn stop_process(&self) -> bool {
        ProcessHandle::stop_process(self)
    }
}

impl ManagedChild for ProcessHandle {
    fn label(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> Option<u32> {
        ProcessHandle::pid(self)
    }

    fn terminate(&self) {
        ProcessHandle::stop_process(self);
    }

    fn kill(&self) {
        self.kill.cancel();
        if self.has_exited() {
            return;
        }
        if let Some(pid) = ProcessHandle::pid(self) {
            if let Err(e) = self.platform.kill(pid) {
                trace!(process = %self.name, pid, error = %e, "Kill failed");
            }
        }
    }

    fn is_alive(&self) -> bool {
        !self.has_exited()
    }
}
