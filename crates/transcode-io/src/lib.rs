//! Supervision of external transcoders and buffering of their output.
//!
//! A media server launches a transcoder, reads its output through a circular
//! buffer, and hands any number of HTTP readers a stream over that buffer.
//! The crate covers:
//!
//! - [`pipe`]: named IPC endpoints (FIFOs on Unix, named pipes on Windows)
//! - [`consumer`]: what to do with a process output stream
//! - [`buffer`]: the streaming ring buffer with timestamp shifting
//! - [`process`]: launching, supervising and stopping processes
//! - [`registry`]: deadlines and the terminate/kill ladder
//!
//! Operating system specifics sit behind [`platform::Platform`].

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod modifier;
pub mod params;
pub mod pipe;
pub mod platform;
pub mod process;
pub mod registry;

pub use buffer::{
    BufferObserver, BufferReader, BufferSettings, ConnectionPolicy, ReadOutcome, RingBuffer,
    StopTarget,
};
pub use config::TranscodeConfig;
pub use consumer::{ConsumedOutput, LineDecision, OutputConsumer};
pub use error::{Result, TranscodeError};
pub use modifier::StreamModifier;
pub use params::OutputParams;
pub use pipe::{PipeName, PipeOptions, PipeTransport};
pub use platform::Platform;
pub use process::{
    CommandBuilder, CommandLine, MediaSource, ProcessHandle, ProcessRunResult, ProcessState,
    TranscodeSupervisor,
};
pub use registry::{ManagedChild, ProcessRegistry, TerminationState};
