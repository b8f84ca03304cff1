//! Error types for transcode supervision and buffering.

use thiserror::Error;

/// Result type for transcode-io operations.
pub type Result<T> = std::result::Result<T, TranscodeError>;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipe {name} failed: {reason}")]
    Pipe { name: String, reason: String },

    #[error("Cannot allocate a {requested} byte buffer")]
    Allocation { requested: usize },

    #[error("Reader fell behind the buffer: offset {requested}, oldest buffered byte {oldest}")]
    Overrun { requested: u64, oldest: u64 },

    #[error("Buffer has been released")]
    BufferReleased,

    #[error("Reader was closed")]
    ReaderClosed,

    #[error("Process {name} timed out after {timeout_ms} ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signal error: {0}")]
    Signal(#[from] process_utils::SignalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TranscodeError {
    pub fn pipe(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Pipe {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error only means a stream has ended or was torn down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::BufferReleased | Self::ReaderClosed)
    }
}
