//! Reader that switches to a standby connection when its peer goes away.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

type Standby<R> = Pin<Box<dyn Future<Output = io::Result<R>> + Send>>;

/// Reads from `current`; on its end of stream, waits for `standby` to
/// resolve and continues from the new connection. At most one switch.
///
/// If the standby fails (for example because it timed out waiting for a
/// peer) the stream ends normally.
pub struct ReconnectingReader<R> {
    current: R,
    standby: Option<Standby<R>>,
    switched: bool,
}

impl<R> ReconnectingReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new<F>(current: R, standby: F) -> Self
    where
        F: Future<Output = io::Result<R>> + Send + 'static,
    {
        Self {
            current,
            standby: Some(Box::pin(standby)),
            switched: false,
        }
    }

    pub fn has_switched(&self) -> bool {
        self.switched
    }
}

impl<R> AsyncRead for ReconnectingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let before = buf.filled().len();
            match Pin::new(&mut this.current).poll_read(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                    let Some(standby) = this.standby.as_mut() else {
                        return Poll::Ready(Ok(()));
                    };
                    match standby.as_mut().poll(cx) {
                        Poll::Ready(Ok(next)) => {
                            debug!("Pipe peer reconnected, switching to standby instance");
                            this.standby = None;
                            this.current = next;
                            this.switched = true;
                        }
                        Poll::Ready(Err(e)) => {
                            debug!(error = %e, "No pipe reconnection");
                            this.standby = None;
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[tokio::test]
    async fn test_switches_once() {
        let (mut first_tx, first_rx) = tokio::io::duplex(64);
        let (mut second_tx, second_rx) = tokio::io::duplex(64);

        first_tx.write_all(b"abc").await.unwrap();
        drop(first_tx);
        second_tx.write_all(b"def").await.unwrap();
        drop(second_tx);

        let mut reader = ReconnectingReader::new(first_rx, async move { Ok(second_rx) });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
        assert!(reader.has_switched());
    }

    #[tokio::test]
    async fn test_failed_standby_ends_stream() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"only").await.unwrap();
        drop(tx);

        let standby = async { Err::<DuplexStream, _>(io::Error::from(io::ErrorKind::TimedOut)) };
        let mut reader = ReconnectingReader::new(rx, standby);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"only");
        assert!(!reader.has_switched());
    }
}
