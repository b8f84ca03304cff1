//! FIFO-file transport.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{debug, trace};

use super::{PipeChannel, PipeDirection, PipeName, PipeTransport};
use crate::error::{Result, TranscodeError};

#[derive(Debug)]
pub struct FifoTransport {
    name: PipeName,
    path: PathBuf,
    direction: PipeDirection,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl FifoTransport {
    /// Create the FIFO file at `<dir>/<name>`.
    pub fn create(dir: &Path, name: PipeName, direction: PipeDirection) -> Result<Self> {
        let path = dir.join(name.as_str());
        nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o777))
            .map_err(|e| TranscodeError::pipe(name.as_str(), format!("mkfifo {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Created FIFO");
        Ok(Self {
            name,
            path,
            direction,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Complete a pending blocking open by briefly attaching the other end.
    fn release_waiter(&self) {
        let mut options = OpenOptions::new();
        match self.direction {
            PipeDirection::Inbound => options.write(true),
            PipeDirection::Outbound => options.read(true),
        };
        // fails with ENXIO when nobody is waiting to read, which is fine
        if options.custom_flags(OFlag::O_NONBLOCK.bits()).open(&self.path).is_ok() {
            trace!(path = %self.path.display(), "Released pending FIFO open");
        }
    }
}

#[async_trait]
impl PipeTransport for FifoTransport {
    fn name(&self) -> &PipeName {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn direction(&self) -> PipeDirection {
        self.direction
    }

    async fn open(&self) -> Result<PipeChannel> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TranscodeError::pipe(self.name.as_str(), "pipe already closed"));
        }
        let path = self.path.clone();
        let direction = self.direction;
        trace!(path = %path.display(), ?direction, "Waiting for FIFO peer");

        // open(2) on a FIFO blocks until the other end is opened too
        let file = tokio::task::spawn_blocking(move || {
            let mut options = OpenOptions::new();
            match direction {
                PipeDirection::Inbound => options.read(true),
                PipeDirection::Outbound => options.write(true),
            };
            options.open(&path)
        })
        .await
        .map_err(|e| TranscodeError::pipe(self.name.as_str(), e))?
        .map_err(|e| TranscodeError::pipe(self.name.as_str(), e))?;

        self.opened.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "FIFO connected");
        let file = tokio::fs::File::from_std(file);
        Ok(match direction {
            PipeDirection::Inbound => PipeChannel::new(self.name.clone(), Some(Box::new(file)), None),
            PipeDirection::Outbound => PipeChannel::new(self.name.clone(), None, Some(Box::new(file))),
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.opened.load(Ordering::Acquire) {
            self.release_waiter();
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "Removed FIFO"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %self.path.display(), error = %e, "Cannot remove FIFO"),
        }
    }
}

impl Drop for FifoTransport {
    fn drop(&mut self) {
        self.close();
    }
}
