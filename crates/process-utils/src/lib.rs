//! Process helpers for spawning and stopping external transcoders.
//!
//! - command construction that never flashes a console window on Windows
//! - short executable labels used to name processes in logs
//! - `PATH` merging for child environments
//! - per-OS signal delivery by pid, see [`signal`]

use std::ffi::{OsStr, OsString};
use std::path::Path;

pub mod signal;

pub use signal::{SignalError, is_alive, kill, terminate};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// A `std::process::Command` with `CREATE_NO_WINDOW`, for the blocking
/// helpers `signal` runs on Windows.
#[cfg(windows)]
pub(crate) fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Short name of an executable: file name without directories or extension.
///
/// `/usr/bin/ffmpeg` and `C:\tools\ffmpeg.exe` both become `ffmpeg`.
pub fn executable_label(program: impl AsRef<OsStr>) -> String {
    let program = program.as_ref().to_string_lossy();
    // split on both separators so Windows paths label correctly everywhere
    let file = program
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("process");
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string())
}

/// Prepend `provided` to the inherited `PATH`.
///
/// Returns `provided` unchanged when there is no inherited `PATH` or the
/// joined value cannot be represented.
pub fn merge_path(provided: &OsStr) -> OsString {
    let Some(inherited) = std::env::var_os("PATH") else {
        return provided.to_os_string();
    };
    let paths = std::env::split_paths(provided).chain(std::env::split_paths(&inherited));
    std::env::join_paths(paths).unwrap_or_else(|_| provided.to_os_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_label() {
        assert_eq!(executable_label("/usr/bin/ffmpeg"), "ffmpeg");
        assert_eq!(executable_label(r"C:\tools\ffmpeg.exe"), "ffmpeg");
        assert_eq!(executable_label("tsMuxeR"), "tsMuxeR");
        assert_eq!(executable_label("/opt/bin/"), "process");
    }

    #[test]
    fn test_merge_path_prepends() {
        let extra = std::env::join_paths(["/opt/transcoders"]).unwrap();
        let merged = merge_path(&extra);
        let first = std::env::split_paths(&merged).next().unwrap();
        assert_eq!(first, Path::new("/opt/transcoders"));
    }
}
