//! Native Windows named pipe transport.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace, warn};

use super::{PipeChannel, PipeDirection, PipeName, PipeOptions, PipeTransport, ReconnectingReader};
use crate::error::{Result, TranscodeError};

/// How long a dropped peer has to reconnect to the standby instance.
const RECONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct NamedPipeTransport {
    name: PipeName,
    path: PathBuf,
    options: PipeOptions,
    server: Mutex<Option<NamedPipeServer>>,
    /// Cancelled by `close`; ends a pending connect and any open transfer
    closed: CancellationToken,
}

impl NamedPipeTransport {
    /// Create the first pipe instance at `\\.\pipe\<name>`.
    pub fn create(name: PipeName, options: PipeOptions) -> Result<Self> {
        let path = PathBuf::from(format!(r"\\.\pipe\{}", name.as_str()));
        let server = server_options(&options)
            .first_pipe_instance(true)
            .create(&path)
            .map_err(|e| TranscodeError::pipe(name.as_str(), e))?;
        debug!(path = %path.display(), "Created named pipe");
        Ok(Self {
            name,
            path,
            options,
            server: Mutex::new(Some(server)),
            closed: CancellationToken::new(),
        })
    }
}

fn server_options(options: &PipeOptions) -> ServerOptions {
    let inbound = options.direction == PipeDirection::Inbound;
    let mut server = ServerOptions::new();
    server
        .access_inbound(inbound)
        .access_outbound(!inbound)
        .in_buffer_size(options.buffer_size)
        .out_buffer_size(options.buffer_size);
    server
}

#[async_trait]
impl PipeTransport for NamedPipeTransport {
    fn name(&self) -> &PipeName {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn direction(&self) -> PipeDirection {
        self.options.direction
    }

    async fn open(&self) -> Result<PipeChannel> {
        let server = self
            .server
            .lock()
            .take()
            .ok_or_else(|| TranscodeError::pipe(self.name.as_str(), "pipe already opened or closed"))?;

        trace!(path = %self.path.display(), "Waiting for named pipe client");
        tokio::select! {
            connected = server.connect() => {
                connected.map_err(|e| TranscodeError::pipe(self.name.as_str(), e))?;
            }
            _ = self.closed.cancelled() => {
                return Err(TranscodeError::pipe(self.name.as_str(), "pipe closed while waiting for a client"));
            }
        }
        debug!(path = %self.path.display(), "Named pipe connected");

        match self.options.direction {
            PipeDirection::Inbound if self.options.force_reconnect => {
                // the standby instance exists before the first peer can drop
                let standby = server_options(&self.options)
                    .create(&self.path)
                    .map_err(|e| TranscodeError::pipe(self.name.as_str(), e))?;
                let reconnect = async move {
                    tokio::time::timeout(RECONNECT_GRACE, standby.connect())
                        .await
                        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
                    Ok::<_, io::Error>(standby)
                };
                let reader = ReconnectingReader::new(server, reconnect);
                let reader = Closable::new(reader, &self.closed);
                Ok(PipeChannel::new(self.name.clone(), Some(Box::new(reader)), None))
            }
            PipeDirection::Inbound => {
                let reader = Closable::new(server, &self.closed);
                Ok(PipeChannel::new(self.name.clone(), Some(Box::new(reader)), None))
            }
            PipeDirection::Outbound => {
                let writer = Closable::new(server, &self.closed);
                Ok(PipeChannel::new(self.name.clone(), None, Some(Box::new(writer))))
            }
        }
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(server) = self.server.lock().take() {
            if let Err(e) = server.disconnect() {
                warn!(path = %self.path.display(), error = %e, "Cannot disconnect named pipe");
            }
        }
        trace!(path = %self.path.display(), "Closed named pipe");
    }
}

/// A connected pipe end that stops transferring once its transport is
/// closed. Reads see end of stream, writes fail with `BrokenPipe`; the
/// instance itself is released when the owner drops it.
struct Closable<T> {
    inner: T,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> Closable<T> {
    fn new(inner: T, closed: &CancellationToken) -> Self {
        Self {
            inner,
            closed: Box::pin(closed.clone().cancelled_owned()),
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.closed.as_mut().poll(cx).is_ready()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Closable<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Closable<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
