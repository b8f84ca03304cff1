//! Stop processes by pid.
//!
//! [`terminate`] asks politely (SIGTERM, or `taskkill` without `/F`),
//! [`kill`] does not (SIGKILL, or `taskkill /F`). Both target only the
//! given pid; callers that own a process tree stop the children themselves.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Invalid pid: {0}")]
    InvalidPid(u32),

    #[error("No such process: {0}")]
    NotFound(u32),

    #[cfg(unix)]
    #[error("Failed to send {signal} to pid {pid}: {source}")]
    Signal {
        signal: nix::sys::signal::Signal,
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("taskkill failed for pid {pid}: {reason}")]
    TaskKill { pid: u32, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    use super::{Result, SignalError};

    fn to_pid(pid: u32) -> Result<Pid> {
        // 0 and negative values address process groups
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
            _ => Err(SignalError::InvalidPid(pid)),
        }
    }

    fn send(pid: u32, sig: Signal) -> Result<()> {
        signal::kill(to_pid(pid)?, sig).map_err(|e| match e {
            Errno::ESRCH => SignalError::NotFound(pid),
            source => SignalError::Signal {
                signal: sig,
                pid,
                source,
            },
        })
    }

    pub fn terminate(pid: u32) -> Result<()> {
        send(pid, Signal::SIGTERM)
    }

    pub fn kill(pid: u32) -> Result<()> {
        send(pid, Signal::SIGKILL)
    }

    pub fn is_alive(pid: u32) -> bool {
        let Ok(pid) = to_pid(pid) else {
            return false;
        };
        // EPERM still means the process exists
        matches!(signal::kill(pid, None), Ok(()) | Err(Errno::EPERM))
    }
}

#[cfg(windows)]
mod imp {
    use std::process::Stdio;

    use super::{Result, SignalError};
    use crate::std_command;

    fn taskkill(pid: u32, force: bool) -> Result<()> {
        if pid == 0 {
            return Err(SignalError::InvalidPid(pid));
        }
        let mut cmd = std_command("taskkill");
        if force {
            cmd.arg("/F");
        }
        let output = cmd
            .arg("/PID")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .output()?;
        if output.status.success() {
            return Ok(());
        }
        // exit code 128: process not found
        if output.status.code() == Some(128) {
            return Err(SignalError::NotFound(pid));
        }
        Err(SignalError::TaskKill {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    pub fn terminate(pid: u32) -> Result<()> {
        taskkill(pid, false)
    }

    pub fn kill(pid: u32) -> Result<()> {
        taskkill(pid, true)
    }

    pub fn is_alive(pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let filter = format!("PID eq {pid}");
        std_command("tasklist")
            .args(["/NH", "/FO", "CSV", "/FI", &filter])
            .stdin(Stdio::null())
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
            .unwrap_or(false)
    }
}

/// Ask the process to exit.
pub fn terminate(pid: u32) -> Result<()> {
    tracing::trace!(pid, "Sending terminate request");
    imp::terminate(pid)
}

/// Forcibly stop the process.
pub fn kill(pid: u32) -> Result<()> {
    tracing::trace!(pid, "Sending kill request");
    imp::kill(pid)
}

/// Whether a process with this pid currently exists.
pub fn is_alive(pid: u32) -> bool {
    imp::is_alive(pid)
}
