use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::watchdog::spawn_watchdog;
use super::{CommandLine, ProcessHandle};
use crate::buffer::{BufferSettings, RingBuffer, StopTarget};
use crate::config::TranscodeConfig;
use crate::consumer::{ConsumedOutput, OutputConsumer};
use crate::error::{Result, TranscodeError};
use crate::params::{InputPipe, OutputParams, PipeRelay};
use crate::pipe::{ForwardTarget, PipeName, PipeOptions, PipeTransport, forward};
use crate::platform::{self, Platform};
use crate::registry::ProcessRegistry;

/// The media a transcode reads from.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
    pub uri: String,
    pub duration_secs: Option<f64>,
}

impl MediaSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            duration_secs: None,
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Turns a media source into a transcoder command line.
pub trait CommandBuilder: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, source: &MediaSource, params: &OutputParams) -> Result<CommandLine>;
}

/// Launches transcoders and keeps track of them.
pub struct TranscodeSupervisor {
    config: TranscodeConfig,
    platform: Arc<dyn Platform>,
    registry: Arc<ProcessRegistry>,
    counter: AtomicU64,
}

/// Tasks draining one process.
#[derive(Default)]
struct Wiring {
    stderr: Option<JoinHandle<ConsumedOutput>>,
    stdout: Option<JoinHandle<ConsumedOutput>>,
    /// Feeding the ring buffer; everything they carry lands before EOF
    media: Vec<JoinHandle<()>>,
    /// Relays and stdin
    aux: Vec<JoinHandle<()>>,
}

impl TranscodeSupervisor {
    pub fn new(config: TranscodeConfig, platform: Arc<dyn Platform>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            config,
            platform,
            registry,
            counter: AtomicU64::new(0),
        }
    }

    /// Supervisor for the running OS with its own registry.
    pub fn native(config: TranscodeConfig) -> Self {
        let platform = platform::native(&config);
        Self::new(config, platform, Arc::new(ProcessRegistry::new()))
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// A fresh pipe named after `prefix`, for passing to a transcoder.
    pub fn create_pipe(&self, prefix: &str, options: PipeOptions) -> Result<Arc<dyn PipeTransport>> {
        let options = options.with_buffer_size(self.config.pipe_buffer_size);
        self.platform.create_pipe(PipeName::generate(prefix), options)
    }

    pub async fn launch_transcode(
        &self,
        builder: &dyn CommandBuilder,
        source: &MediaSource,
        params: OutputParams,
    ) -> Result<Arc<ProcessHandle>> {
        let command = builder.build(source, &params)?;
        debug!(engine = builder.name(), source = %source.uri, "Launching transcode");
        Ok(self.launch(command, params).await)
    }

    /// Spawn `command` and wire its output according to `params`.
    ///
    /// Never fails: a process that cannot be started comes back as a
    /// completed, unsuccessful handle with no input stream.
    pub async fn launch(&self, command: CommandLine, params: OutputParams) -> Arc<ProcessHandle> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-{id}", command.label());
        let timeout_ms = match params.timeout_ms {
            0 => self.config.default_timeout_ms,
            ms => ms,
        };
        let terminate_timeout = Duration::from_millis(match params.terminate_timeout_ms {
            0 => self.config.default_terminate_timeout_ms,
            ms => ms,
        });

        let mut pipes: Vec<Arc<dyn PipeTransport>> = Vec::new();
        if let Some(input) = &params.input_pipe {
            pipes.push(input.transport.clone());
        }
        for relay in &params.pipe_relays {
            pipes.push(relay.from.clone());
            pipes.push(relay.to.clone());
        }

        let (buffer, allocation_error) = if params.forwards_to_buffer() {
            let platform = self.platform.clone();
            let settings = BufferSettings::from_params(&params, &self.config)
                .with_memory_probe(move || platform.available_memory());
            match RingBuffer::new(settings) {
                Ok(buffer) => (Some(buffer), None),
                Err(e) => (None, Some(e)),
            }
        } else {
            (None, None)
        };

        let handle = ProcessHandle::new(
            name,
            command,
            params.clone(),
            self.platform.clone(),
            self.registry.clone(),
            buffer.clone(),
            pipes,
            terminate_timeout,
        );

        if let Some(e) = allocation_error {
            error!(process = handle.name(), error = %e, "Cannot allocate output buffer");
            fail_before_start(&handle, e);
            return handle;
        }

        if let Some(buffer) = &buffer {
            let owner: Weak<dyn StopTarget> = Arc::downgrade(&handle) as Weak<dyn StopTarget>;
            if let Err(e) = buffer.attach_owner(owner) {
                warn!(process = handle.name(), error = %e, "Buffer owner not attached");
            }
            if let Some(header) = &params.header {
                if let Err(e) = buffer.write(header).await {
                    debug!(process = handle.name(), error = %e, "Header not buffered");
                }
            }
        }

        let mut child = match build_command(handle.command(), &params).spawn() {
            Ok(child) => child,
            Err(e) => {
                let e = TranscodeError::spawn(handle.command().label(), e);
                error!(process = handle.name(), command = %handle.command(), error = %e, "Failed to start process");
                fail_before_start(&handle, e);
                return handle;
            }
        };
        let pid = child.id();
        handle.set_running(pid);
        info!(process = handle.name(), pid, command = %handle.command(), "Started process");

        let exited = CancellationToken::new();
        let wiring = wire_output(&handle, &mut child, buffer.as_ref(), &params, &exited);

        if timeout_ms > 0 {
            let id = self.registry.add_process(
                handle.clone(),
                Duration::from_millis(timeout_ms),
                terminate_timeout,
            );
            handle.set_registration(id);
        }
        if params.watchdog_ms > 0 {
            spawn_watchdog(&handle, Duration::from_millis(params.watchdog_ms));
        }

        tokio::spawn(supervise(
            handle.clone(),
            child,
            wiring,
            exited,
            self.config.consumer_join(),
        ));

        if params.wait_before_start > 0 {
            trace!(process = handle.name(), ms = params.wait_before_start, "Waiting before start");
            tokio::time::sleep(Duration::from_millis(params.wait_before_start)).await;
        }
        handle
    }
}

fn build_command(command: &CommandLine, params: &OutputParams) -> tokio::process::Command {
    let mut cmd = command.to_command();
    if let Some(dir) = &params.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &params.env {
        if matches!(key.as_str(), "PATH" | "Path" | "path") {
            cmd.env(key, process_utils::merge_path(OsStr::new(value)));
        } else {
            cmd.env(key, value);
        }
    }
    cmd.stdin(if params.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    cmd
}

fn fail_before_start(handle: &ProcessHandle, error: TranscodeError) {
    handle.record_error(&error);
    if let Some(buffer) = handle.buffer() {
        buffer.reset();
    }
    handle.close_pipes();
    handle.finish(None);
}

fn wire_output(
    handle: &Arc<ProcessHandle>,
    child: &mut Child,
    buffer: Option<&Arc<RingBuffer>>,
    params: &OutputParams,
    exited: &CancellationToken,
) -> Wiring {
    let mut wiring = Wiring::default();
    let name = handle.name().to_string();

    if let Some(stderr) = child.stderr.take() {
        let consumer = if params.keep_stderr {
            OutputConsumer::text()
        } else {
            OutputConsumer::Discard { log: true }
        };
        wiring.stderr = Some(consumer.spawn(stderr, name.clone()));
    }

    if let Some(stdout) = child.stdout.take() {
        match (buffer, &params.input_pipe) {
            (Some(buffer), None) => {
                let consumer = OutputConsumer::Buffer(buffer.clone());
                let label = name.clone();
                wiring.media.push(tokio::spawn(async move {
                    let out = consumer.consume(stdout, &label).await;
                    trace!(process = %label, ?out, "Standard output drained");
                }));
            }
            _ => {
                let consumer = if params.log && params.keep_stdout {
                    OutputConsumer::text()
                } else {
                    OutputConsumer::Discard { log: true }
                };
                wiring.stdout = Some(consumer.spawn(stdout, name.clone()));
            }
        }
    }

    if let (Some(buffer), Some(input)) = (buffer, &params.input_pipe) {
        wiring.media.push(spawn_input_forwarder(
            handle,
            input.clone(),
            buffer.clone(),
            exited.clone(),
        ));
    }

    for relay in &params.pipe_relays {
        wiring
            .aux
            .push(spawn_relay(handle, relay.clone(), exited.clone()));
    }

    if let (Some(source), Some(stdin)) = (params.stdin.clone(), child.stdin.take()) {
        let label = name;
        wiring.aux.push(tokio::spawn(async move {
            if let Err(e) = source.push(Box::new(stdin)).await {
                debug!(process = %label, error = %e, "Standard input closed early");
            }
        }));
    }
    wiring
}

/// Open the transcoder's output pipe and forward it into the buffer.
///
/// A pipe that fails leaves the process without an input stream: the buffer
/// is released so readers see the end instead of waiting.
fn spawn_input_forwarder(
    handle: &Arc<ProcessHandle>,
    input: InputPipe,
    buffer: Arc<RingBuffer>,
    exited: CancellationToken,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(handle);
    let name = handle.name().to_string();
    let InputPipe {
        transport,
        modifier,
    } = input;
    tokio::spawn(async move {
        let result = async {
            let channel = tokio::select! {
                channel = transport.open() => channel?,
                _ = exited.cancelled() => {
                    debug!(process = %name, pipe = %transport.name(), "Process ended before opening its pipe");
                    return Ok(0);
                }
            };
            forward(channel.into_reader()?, ForwardTarget::Buffer(buffer.clone()), modifier).await
        }
        .await;

        match result {
            Ok(bytes) => trace!(process = %name, pipe = %transport.name(), bytes, "Input pipe drained"),
            Err(e) => {
                error!(process = %name, pipe = %transport.name(), error = %e, "Input pipe failed");
                if let Some(handle) = weak.upgrade() {
                    handle.record_error(&e);
                }
                buffer.reset();
            }
        }
    })
}

fn spawn_relay(handle: &Arc<ProcessHandle>, relay: PipeRelay, exited: CancellationToken) -> JoinHandle<()> {
    let weak = Arc::downgrade(handle);
    let name = handle.name().to_string();
    let PipeRelay { from, to, modifier } = relay;
    tokio::spawn(async move {
        let result = async {
            let (source, sink) = tokio::select! {
                pair = async { tokio::try_join!(from.open(), to.open()) } => pair?,
                _ = exited.cancelled() => return Ok(0),
            };
            forward(source.into_reader()?, ForwardTarget::Writer(sink.into_writer()?), modifier).await
        }
        .await;

        match result {
            Ok(bytes) => trace!(process = %name, from = %from.name(), to = %to.name(), bytes, "Relay finished"),
            Err(e) => {
                warn!(process = %name, from = %from.name(), to = %to.name(), error = %e, "Relay failed");
                if let Some(handle) = weak.upgrade() {
                    handle.record_error(&e);
                }
            }
        }
    })
}

async fn kill_child(child: &mut Child) -> io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}

/// Wait for the process, then drain, close and account for everything
/// attached to it.
async fn supervise(
    handle: Arc<ProcessHandle>,
    mut child: Child,
    wiring: Wiring,
    exited: CancellationToken,
    join_timeout: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = handle.stop_token().cancelled() => {
            tokio::select! {
                status = child.wait() => status,
                _ = handle.kill_token().cancelled() => kill_child(&mut child).await,
                _ = tokio::time::sleep(handle.terminate_timeout()) => {
                    warn!(process = handle.name(), pid = handle.pid(), "Process ignored termination, killing");
                    kill_child(&mut child).await
                }
            }
        }
        _ = handle.kill_token().cancelled() => kill_child(&mut child).await,
    };
    handle.mark_exited();
    exited.cancel();

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!(process = handle.name(), error = %e, "Error waiting for process");
            None
        }
    };

    // a stopped process has its buffer released already, its forwarders
    // only drain; otherwise every byte must reach the buffer before EOF
    for task in wiring.media {
        if handle.is_destroyed() {
            let _ = tokio::time::timeout(join_timeout, task).await;
        } else {
            let _ = task.await;
        }
    }
    let stderr = join_lines(wiring.stderr, join_timeout).await;
    let stdout = join_lines(wiring.stdout, join_timeout).await;
    for task in wiring.aux {
        let _ = tokio::time::timeout(join_timeout, task).await;
    }

    if let Some(buffer) = handle.buffer() {
        buffer.close();
    }
    handle.close_pipes();

    if !handle.params().no_exit_check && !handle.is_destroyed() {
        match exit_code {
            Some(0) => debug!(process = handle.name(), "Process exited normally"),
            Some(code) => info!(process = handle.name(), code, "Process exited with a non-zero code, it likely failed"),
            None => info!(process = handle.name(), "Process was terminated by a signal"),
        }
    }

    handle.record_output(stderr, stdout);
    handle.stop_attached();
    handle.finish(exit_code);
    trace!(process = handle.name(), ?exit_code, "Process finished");
}

async fn join_lines(task: Option<JoinHandle<ConsumedOutput>>, limit: Duration) -> Vec<String> {
    let Some(task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(output)) => output.into_lines(),
        Ok(Err(e)) => {
            debug!(error = %e, "Output consumer panicked");
            Vec::new()
        }
        Err(_) => Vec::new(),
    }
}
