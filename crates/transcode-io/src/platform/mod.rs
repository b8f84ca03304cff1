//! OS capabilities the supervisor and buffer need.
//!
//! One implementation per OS family, chosen once with [`native`] and passed
//! around as `Arc<dyn Platform>`. Tests can substitute their own.

use std::sync::Arc;

use sysinfo::System;

use crate::config::TranscodeConfig;
use crate::error::Result;
use crate::pipe::{PipeName, PipeOptions, PipeTransport};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform;

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create an unconnected pipe the transcoder can be pointed at.
    fn create_pipe(&self, name: PipeName, options: PipeOptions) -> Result<Arc<dyn PipeTransport>>;

    /// Ask the process to exit.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Kill the process outright.
    fn kill(&self, pid: u32) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Bytes of memory currently available to allocate.
    fn available_memory(&self) -> u64 {
        available_memory()
    }
}

pub fn available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory()
}

/// Platform implementation for the running OS.
pub fn native(config: &TranscodeConfig) -> Arc<dyn Platform> {
    #[cfg(unix)]
    {
        Arc::new(UnixPlatform::new(config.temp_dir.clone()))
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsPlatform::new(config.pipe_buffer_size))
    }
}
