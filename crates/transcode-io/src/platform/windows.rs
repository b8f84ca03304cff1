use std::sync::Arc;

use super::Platform;
use crate::error::Result;
use crate::pipe::{NamedPipeTransport, PipeName, PipeOptions, PipeTransport};

/// Native named pipes, `taskkill`.
#[derive(Debug, Clone)]
pub struct WindowsPlatform {
    pipe_buffer_size: u32,
}

impl WindowsPlatform {
    pub fn new(pipe_buffer_size: u32) -> Self {
        Self { pipe_buffer_size }
    }
}

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn create_pipe(&self, name: PipeName, options: PipeOptions) -> Result<Arc<dyn PipeTransport>> {
        let options = options.with_buffer_size(self.pipe_buffer_size);
        Ok(Arc::new(NamedPipeTransport::create(name, options)?))
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
