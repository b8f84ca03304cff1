//! Drains a process output handle on its own task.
//!
//! Text is split into records on `\n`, `\r\n` or a lone `\r`, since ffmpeg
//! rewrites its progress line with carriage returns and a pipe never sees
//! a newline for those.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::buffer::RingBuffer;

const READ_CHUNK: usize = 8 * 1024;

/// What a [`LineFilter`] wants done with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDecision {
    Keep,
    Skip,
    /// Keep nothing from here on. The output is still drained.
    Stop,
}

pub type LineFilter = Arc<dyn Fn(&str) -> LineDecision + Send + Sync>;

#[derive(Clone)]
pub enum OutputConsumer {
    Discard { log: bool },
    Text { filter: Option<LineFilter> },
    Bytes,
    Buffer(Arc<RingBuffer>),
}

impl fmt::Debug for OutputConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discard { log } => f.debug_struct("Discard").field("log", log).finish(),
            Self::Text { filter } => f
                .debug_struct("Text")
                .field("filtered", &filter.is_some())
                .finish(),
            Self::Bytes => f.write_str("Bytes"),
            Self::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumedOutput {
    Discarded,
    Lines(Vec<String>),
    Bytes(Bytes),
    /// Bytes accepted by the buffer
    Forwarded(u64),
}

impl ConsumedOutput {
    pub fn lines(&self) -> &[String] {
        match self {
            Self::Lines(lines) => lines,
            _ => &[],
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        match self {
            Self::Lines(lines) => lines,
            _ => Vec::new(),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Bytes(bytes) => bytes,
            _ => Bytes::new(),
        }
    }
}

impl OutputConsumer {
    pub fn text() -> Self {
        Self::Text { filter: None }
    }

    pub fn filtered(filter: impl Fn(&str) -> LineDecision + Send + Sync + 'static) -> Self {
        Self::Text {
            filter: Some(Arc::new(filter)),
        }
    }

    /// Consume `source` on a new task.
    pub fn spawn<R>(self, source: R, label: impl Into<String>) -> JoinHandle<ConsumedOutput>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let label = label.into();
        tokio::spawn(async move { self.consume(source, &label).await })
    }

    /// Read `source` to its end. A read error counts as end of output.
    pub async fn consume<R>(self, mut source: R, label: &str) -> ConsumedOutput
    where
        R: AsyncRead + Unpin,
    {
        let mut sink = Sink::new(self);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.accept(&chunk[..n], label).await,
                Err(e) => {
                    debug!(process = label, error = %e, "Output closed early");
                    break;
                }
            }
        }
        drop(source);
        sink.finish(label)
    }
}

enum Sink {
    Discard { log: bool, records: RecordSplitter },
    Text {
        filter: Option<LineFilter>,
        records: RecordSplitter,
        lines: Vec<String>,
        stopped: bool,
    },
    Bytes(BytesMut),
    Buffer {
        buffer: Arc<RingBuffer>,
        forwarded: u64,
        released: bool,
    },
}

impl Sink {
    fn new(consumer: OutputConsumer) -> Self {
        match consumer {
            OutputConsumer::Discard { log } => Self::Discard {
                log,
                records: RecordSplitter::default(),
            },
            OutputConsumer::Text { filter } => Self::Text {
                filter,
                records: RecordSplitter::default(),
                lines: Vec::new(),
                stopped: false,
            },
            OutputConsumer::Bytes => Self::Bytes(BytesMut::new()),
            OutputConsumer::Buffer(buffer) => Self::Buffer {
                buffer,
                forwarded: 0,
                released: false,
            },
        }
    }

    async fn accept(&mut self, chunk: &[u8], label: &str) {
        match self {
            Self::Discard { log, records } => {
                if *log {
                    for line in records.push(chunk) {
                        debug!(process = label, "{line}");
                    }
                }
            }
            Self::Text {
                filter,
                records,
                lines,
                stopped,
            } => {
                for line in records.push(chunk) {
                    keep_line(filter.as_ref(), line, lines, stopped);
                }
            }
            Self::Bytes(bytes) => bytes.extend_from_slice(chunk),
            Self::Buffer {
                buffer,
                forwarded,
                released,
            } => {
                // after a release the rest is drained so the process never blocks on a full pipe
                if *released {
                    return;
                }
                match buffer.write(chunk).await {
                    Ok(()) => *forwarded += chunk.len() as u64,
                    Err(e) => {
                        trace!(process = label, error = %e, "Buffer gone, discarding remaining output");
                        *released = true;
                    }
                }
            }
        }
    }

    fn finish(self, label: &str) -> ConsumedOutput {
        match self {
            Self::Discard { log, records } => {
                if let Some(line) = records.finish().filter(|_| log) {
                    debug!(process = label, "{line}");
                }
                ConsumedOutput::Discarded
            }
            Self::Text {
                filter,
                records,
                mut lines,
                mut stopped,
            } => {
                if let Some(line) = records.finish() {
                    keep_line(filter.as_ref(), line, &mut lines, &mut stopped);
                }
                ConsumedOutput::Lines(lines)
            }
            Self::Bytes(bytes) => ConsumedOutput::Bytes(bytes.freeze()),
            Self::Buffer { forwarded, .. } => ConsumedOutput::Forwarded(forwarded),
        }
    }
}

fn keep_line(filter: Option<&LineFilter>, line: String, lines: &mut Vec<String>, stopped: &mut bool) {
    if *stopped {
        return;
    }
    match filter.map_or(LineDecision::Keep, |f| f(&line)) {
        LineDecision::Keep => lines.push(line),
        LineDecision::Skip => {}
        LineDecision::Stop => *stopped = true,
    }
}

/// Incremental `\n` / `\r\n` / `\r` record splitter, lossy UTF-8.
#[derive(Debug, Default)]
pub struct RecordSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl RecordSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut records = Vec::new();
        for &b in chunk {
            match b {
                // second half of a CRLF, the record went out with the CR
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    records.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                    self.after_cr = b == b'\r';
                }
                _ => {
                    self.pending.push(b);
                    self.after_cr = false;
                }
            }
        }
        records
    }

    /// Unterminated trailing record, if any.
    pub fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| String::from_utf8_lossy(&self.pending).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_splitter_handles_cr_lf_and_crlf() {
        let mut splitter = RecordSplitter::default();
        let mut records = splitter.push(b"one\rtwo\nthr");
        records.extend(splitter.push(b"ee\r"));
        records.extend(splitter.push(b"\nfour\n\nfive"));
        assert_eq!(records, vec!["one", "two", "three", "four", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("five"));
    }

    #[tokio::test]
    async fn test_text_capture_with_stop() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            tx.write_all(b"Stream #0:0: Video: h264\nskip me\nDuration: 00:01:00\nlater\n")
                .await
                .unwrap();
        });

        let consumer = OutputConsumer::filtered(|line| {
            if line.starts_with("Duration") {
                LineDecision::Stop
            } else if line.starts_with("skip") {
                LineDecision::Skip
            } else {
                LineDecision::Keep
            }
        });
        let output = consumer.spawn(rx, "ffmpeg-1").await.unwrap();
        assert_eq!(output.into_lines(), vec!["Stream #0:0: Video: h264"]);
    }

    #[tokio::test]
    async fn test_byte_capture() {
        let (mut tx, rx) = tokio::io::duplex(16);
        tokio::spawn(async move {
            tx.write_all(&[0u8, 159, 146, 150, 255]).await.unwrap();
        });
        let output = OutputConsumer::Bytes.consume(rx, "probe").await;
        assert_eq!(output.into_bytes().as_ref(), &[0u8, 159, 146, 150, 255]);
    }

    #[tokio::test]
    async fn test_discard_drains_everything() {
        let (mut tx, rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            for _ in 0..100 {
                tx.write_all(b"progress=continue\r").await.unwrap();
            }
        });
        let output = OutputConsumer::Discard { log: true }.consume(rx, "ffmpeg-2").await;
        writer.await.unwrap();
        assert_eq!(output, ConsumedOutput::Discarded);
    }
}
