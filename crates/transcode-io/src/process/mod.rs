//! Transcoder process supervision.
//!
//! [`TranscodeSupervisor::launch`] spawns a process, wires its output into
//! consumers (and, for media output, a ring buffer), optionally registers
//! it for a deadline, and hands back a [`ProcessHandle`]. Failures to start
//! are recorded on the handle, never returned to the streaming layer.

use std::ffi::{OsStr, OsString};
use std::fmt;

mod handle;
mod runner;
mod supervisor;
mod watchdog;

pub use handle::ProcessHandle;
pub use runner::{
    ProcessRunResult, UNKNOWN_EXIT_CODE, run_process, run_process_bytes, run_process_discard,
    run_process_lines, spawn_process,
};
pub use supervisor::{CommandBuilder, MediaSource, TranscodeSupervisor};

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    /// Exited on its own, or never started
    Completed,
    /// Stopped by us
    Destroyed,
}

/// Program plus arguments, as handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLine {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Short name for logs, e.g. `ffmpeg` for `/usr/bin/ffmpeg`.
    pub fn label(&self) -> String {
        process_utils::executable_label(&self.program)
    }

    fn to_command(&self) -> tokio::process::Command {
        let mut command = process_utils::tokio_command(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_display_and_label() {
        let command = CommandLine::new("/usr/bin/ffmpeg")
            .args(["-ss", "30"])
            .arg("-i")
            .arg("movie.mkv");
        assert_eq!(command.to_string(), "/usr/bin/ffmpeg -ss 30 -i movie.mkv");
        assert_eq!(command.label(), "ffmpeg");
        assert_eq!(command.get_args().len(), 4);
    }
}
