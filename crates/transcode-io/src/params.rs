//! Per-launch options.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::buffer::BufferObserver;
use crate::modifier::StreamModifier;
use crate::pipe::PipeTransport;

/// Bytes per buffer-size megabyte.
pub const MEGABYTE: f64 = 1_048_576.0;

/// Default minimum for reads after the first one.
pub const DEFAULT_SECOND_READ_MIN_SIZE: usize = 100_000;

/// Something that feeds a transcoder's standard input.
#[async_trait]
pub trait PushSource: Send + Sync {
    async fn push(&self, sink: Box<dyn AsyncWrite + Send + Unpin>) -> std::io::Result<()>;
}

#[async_trait]
impl PushSource for Bytes {
    async fn push(&self, mut sink: Box<dyn AsyncWrite + Send + Unpin>) -> std::io::Result<()> {
        sink.write_all(self).await?;
        sink.shutdown().await
    }
}

/// Pipe the transcoder writes its media output to, read instead of stdout.
#[derive(Clone)]
pub struct InputPipe {
    pub transport: Arc<dyn PipeTransport>,
    pub modifier: StreamModifier,
}

/// Two pipes joined by a forwarder, e.g. a demuxer feeding an encoder.
#[derive(Clone)]
pub struct PipeRelay {
    pub from: Arc<dyn PipeTransport>,
    pub to: Arc<dyn PipeTransport>,
    pub modifier: StreamModifier,
}

/// Options for one launch. Built with the `with_*` methods and then handed
/// to the supervisor, which never changes them.
#[derive(Clone)]
pub struct OutputParams {
    /// Data (MB) a first read waits for
    pub min_buffer_size: f64,
    /// Ring buffer capacity (MB)
    pub max_buffer_size: f64,
    /// Start of the transcode in the source (seconds)
    pub time_seek: f64,
    /// End of the transcode in the source (seconds), 0 for open-ended
    pub time_end: f64,
    /// Delay (ms) after spawning before `launch` returns
    pub wait_before_start: u64,
    /// Data (bytes) reads after the first one wait for
    pub second_read_min_size: usize,
    pub no_exit_check: bool,
    /// Stdout carries log text rather than media
    pub log: bool,
    /// Suppress buffer usage reporting
    pub hide_buffer: bool,
    /// Stop the process once the stream ends and readers are gone
    pub cleanup: bool,
    /// Shift SCR fields when seeking
    pub shift_scr: bool,
    /// Bytes placed in the buffer before any process output
    pub header: Option<Bytes>,
    pub input_pipe: Option<InputPipe>,
    pub pipe_relays: Vec<PipeRelay>,
    pub stdin: Option<Arc<dyn PushSource>>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Registry deadline (ms), 0 for none
    pub timeout_ms: u64,
    pub terminate_timeout_ms: u64,
    /// Independent stop timer (ms), 0 for none
    pub watchdog_ms: u64,
    pub keep_stdout: bool,
    pub keep_stderr: bool,
    /// Raw copy of everything written to the buffer
    pub debug_dump: Option<PathBuf>,
    pub observer: Option<Arc<dyn BufferObserver>>,
}

impl Default for OutputParams {
    fn default() -> Self {
        Self {
            min_buffer_size: 1.0,
            max_buffer_size: 100.0,
            time_seek: 0.0,
            time_end: 0.0,
            wait_before_start: 0,
            second_read_min_size: DEFAULT_SECOND_READ_MIN_SIZE,
            no_exit_check: false,
            log: false,
            hide_buffer: false,
            cleanup: false,
            shift_scr: false,
            header: None,
            input_pipe: None,
            pipe_relays: Vec::new(),
            stdin: None,
            working_dir: None,
            env: HashMap::new(),
            timeout_ms: 0,
            terminate_timeout_ms: 0,
            watchdog_ms: 0,
            keep_stdout: false,
            keep_stderr: true,
            debug_dump: None,
            observer: None,
        }
    }
}

impl std::fmt::Debug for OutputParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputParams")
            .field("min_buffer_size", &self.min_buffer_size)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("time_seek", &self.time_seek)
            .field("time_end", &self.time_end)
            .field("log", &self.log)
            .field("cleanup", &self.cleanup)
            .field("shift_scr", &self.shift_scr)
            .field("input_pipe", &self.input_pipe.as_ref().map(|p| p.transport.path()))
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl OutputParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer sizes in megabytes.
    pub fn with_buffer_size(mut self, min_mb: f64, max_mb: f64) -> Self {
        self.min_buffer_size = min_mb;
        self.max_buffer_size = max_mb;
        self
    }

    pub fn with_time_range(mut self, seek_secs: f64, end_secs: f64) -> Self {
        self.time_seek = seek_secs;
        self.time_end = end_secs;
        self
    }

    pub fn with_wait_before_start(mut self, ms: u64) -> Self {
        self.wait_before_start = ms;
        self
    }

    pub fn with_second_read_min_size(mut self, bytes: usize) -> Self {
        self.second_read_min_size = bytes;
        self
    }

    pub fn with_no_exit_check(mut self, no_exit_check: bool) -> Self {
        self.no_exit_check = no_exit_check;
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn with_hide_buffer(mut self, hide: bool) -> Self {
        self.hide_buffer = hide;
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_shift_scr(mut self, shift_scr: bool) -> Self {
        self.shift_scr = shift_scr;
        self
    }

    pub fn with_header(mut self, header: impl Into<Bytes>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn with_input_pipe(
        mut self,
        transport: Arc<dyn PipeTransport>,
        modifier: StreamModifier,
    ) -> Self {
        self.input_pipe = Some(InputPipe {
            transport,
            modifier,
        });
        self
    }

    pub fn with_pipe_relay(
        mut self,
        from: Arc<dyn PipeTransport>,
        to: Arc<dyn PipeTransport>,
        modifier: StreamModifier,
    ) -> Self {
        self.pipe_relays.push(PipeRelay { from, to, modifier });
        self
    }

    pub fn with_stdin(mut self, source: Arc<dyn PushSource>) -> Self {
        self.stdin = Some(source);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Registry deadline and the grace period before a hard kill.
    pub fn with_timeout(mut self, timeout_ms: u64, terminate_timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self.terminate_timeout_ms = terminate_timeout_ms;
        self
    }

    pub fn with_watchdog(mut self, ms: u64) -> Self {
        self.watchdog_ms = ms;
        self
    }

    pub fn with_keep_output(mut self, keep_stdout: bool, keep_stderr: bool) -> Self {
        self.keep_stdout = keep_stdout;
        self.keep_stderr = keep_stderr;
        self
    }

    pub fn with_debug_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_dump = Some(path.into());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BufferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn min_buffer_bytes(&self) -> usize {
        megabytes_to_bytes(self.min_buffer_size)
    }

    pub fn max_buffer_bytes(&self) -> usize {
        megabytes_to_bytes(self.max_buffer_size)
    }

    /// Whether stdout (or the input pipe) feeds a ring buffer.
    pub fn forwards_to_buffer(&self) -> bool {
        self.input_pipe.is_some() || !self.log
    }
}

fn megabytes_to_bytes(mb: f64) -> usize {
    if !mb.is_finite() || mb <= 0.0 {
        return 0;
    }
    (mb * MEGABYTE) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let params = OutputParams::new()
            .with_buffer_size(0.1, 1.0)
            .with_time_range(30.0, 0.0)
            .with_shift_scr(true)
            .with_env("PATH", "/opt/bin")
            .with_timeout(10_000, 2_000);
        assert_eq!(params.max_buffer_bytes(), 1_048_576);
        assert_eq!(params.min_buffer_bytes(), 104_857);
        assert_eq!(params.time_seek, 30.0);
        assert!(params.shift_scr);
        assert_eq!(params.env.get("PATH").map(String::as_str), Some("/opt/bin"));
        assert_eq!((params.timeout_ms, params.terminate_timeout_ms), (10_000, 2_000));
        assert!(params.forwards_to_buffer());
    }

    #[test]
    fn test_log_output_skips_buffer() {
        let params = OutputParams::new().with_log(true);
        assert!(!params.forwards_to_buffer());
        assert_eq!(megabytes_to_bytes(-1.0), 0);
        assert_eq!(megabytes_to_bytes(f64::NAN), 0);
    }

    #[tokio::test]
    async fn test_bytes_push_source() {
        let (tx, mut rx) = tokio::io::duplex(64);
        let source = Bytes::from_static(b"feed");
        source.push(Box::new(tx)).await.unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut rx, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"feed");
    }
}
