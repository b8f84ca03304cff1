//! Byte channels between this process and an external transcoder.
//!
//! A transport is created before the transcoder starts, so the transcoder can
//! be told its path on the command line; [`PipeTransport::open`] then waits
//! for the transcoder to attach. Windows uses native named pipes, other
//! systems FIFO files.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, TranscodeError};

#[cfg(unix)]
pub mod fifo;
pub mod forward;
#[cfg(windows)]
pub mod named;
pub mod reconnect;

#[cfg(unix)]
pub use fifo::FifoTransport;
pub use forward::{ForwardTarget, forward};
#[cfg(windows)]
pub use named::NamedPipeTransport;
pub use reconnect::ReconnectingReader;

/// Single-use pipe name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeName(String);

impl PipeName {
    /// `<prefix>_<uuid>`
    pub fn generate(prefix: &str) -> Self {
        let prefix = if prefix.is_empty() { "tcode" } else { prefix };
        Self(format!("{prefix}_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Use a caller-chosen name as is.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(TranscodeError::pipe(name, "invalid pipe name"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Direction, seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// The transcoder writes, we read.
    Inbound,
    /// We write, the transcoder reads.
    Outbound,
}

#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    pub direction: PipeDirection,
    /// Keep a second pipe instance ready so one peer reconnect is survived.
    pub force_reconnect: bool,
    pub buffer_size: u32,
}

impl PipeOptions {
    pub fn inbound() -> Self {
        Self {
            direction: PipeDirection::Inbound,
            force_reconnect: false,
            buffer_size: 500_000,
        }
    }

    pub fn outbound() -> Self {
        Self {
            direction: PipeDirection::Outbound,
            ..Self::inbound()
        }
    }

    pub fn with_force_reconnect(mut self, force: bool) -> Self {
        self.force_reconnect = force;
        self
    }

    pub fn with_buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = size;
        self
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Our end of a connected pipe.
pub struct PipeChannel {
    name: PipeName,
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
}

impl PipeChannel {
    pub fn new(name: PipeName, reader: Option<BoxedReader>, writer: Option<BoxedWriter>) -> Self {
        Self {
            name,
            reader,
            writer,
        }
    }

    pub fn name(&self) -> &PipeName {
        &self.name
    }

    pub fn into_reader(self) -> Result<BoxedReader> {
        self.reader
            .ok_or_else(|| TranscodeError::pipe(self.name.as_str(), "pipe is not readable"))
    }

    pub fn into_writer(self) -> Result<BoxedWriter> {
        self.writer
            .ok_or_else(|| TranscodeError::pipe(self.name.as_str(), "pipe is not writable"))
    }

    pub fn into_parts(self) -> (Option<BoxedReader>, Option<BoxedWriter>) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for PipeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeChannel")
            .field("name", &self.name)
            .field("readable", &self.reader.is_some())
            .field("writable", &self.writer.is_some())
            .finish()
    }
}

#[async_trait]
pub trait PipeTransport: Send + Sync + fmt::Debug {
    fn name(&self) -> &PipeName;

    /// Path handed to the transcoder.
    fn path(&self) -> &Path;

    fn direction(&self) -> PipeDirection;

    /// Wait for the peer and return our end. Fails rather than handing out a
    /// dead stream.
    async fn open(&self) -> Result<PipeChannel>;

    /// Release the pipe. Safe to call more than once.
    fn close(&self);
}
