use std::path::PathBuf;
use std::sync::Arc;

use super::Platform;
use crate::error::Result;
use crate::pipe::{FifoTransport, PipeName, PipeOptions, PipeTransport};

/// FIFO files under `temp_dir`, POSIX signals.
#[derive(Debug, Clone)]
pub struct UnixPlatform {
    temp_dir: PathBuf,
}

impl UnixPlatform {
    pub fn new(temp_dir: PathBuf) -> Self {
        Self { temp_dir }
    }
}

impl Platform for UnixPlatform {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn create_pipe(&self, name: PipeName, options: PipeOptions) -> Result<Arc<dyn PipeTransport>> {
        // a FIFO can be reopened by a new writer, so reconnects need no standby
        let fifo = FifoTransport::create(&self.temp_dir, name, options.direction)?;
        Ok(Arc::new(fifo))
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        Ok(process_utils::terminate(pid)?)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        Ok(process_utils::kill(pid)?)
    }

    fn is_alive(&self, pid: u32) -> bool {
        process_utils::is_alive(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeDirection;

    #[test]
    fn test_create_pipe_in_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let platform = UnixPlatform::new(dir.path().to_path_buf());
        let pipe = platform
            .create_pipe(PipeName::generate("ffmpeg"), PipeOptions::inbound())
            .unwrap();
        assert!(pipe.path().starts_with(dir.path()));
        assert_eq!(pipe.direction(), PipeDirection::Inbound);
        assert!(pipe.path().exists());
        pipe.close();
        assert!(!pipe.path().exists());
    }

    #[test]
    fn test_memory_and_liveness() {
        let platform = UnixPlatform::new(std::env::temp_dir());
        assert!(platform.available_memory() > 0);
        assert!(platform.is_alive(std::process::id()));
    }
}
