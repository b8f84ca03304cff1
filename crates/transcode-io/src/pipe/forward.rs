//! Relays bytes from a pipe into a ring buffer or another pipe.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::BoxedWriter;
use crate::buffer::RingBuffer;
use crate::error::Result;
use crate::modifier::{ModifierState, StreamModifier};

const FORWARD_CHUNK: usize = 64 * 1024;

pub enum ForwardTarget {
    Buffer(Arc<RingBuffer>),
    Writer(BoxedWriter),
}

impl ForwardTarget {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            Self::Buffer(buffer) => buffer.write(data).await,
            Self::Writer(writer) => Ok(writer.write_all(data).await?),
        }
    }

    async fn finish(&mut self) -> Result<()> {
        match self {
            // the supervisor closes the buffer once the process is done
            Self::Buffer(_) => Ok(()),
            Self::Writer(writer) => {
                writer.flush().await?;
                Ok(writer.shutdown().await?)
            }
        }
    }
}

/// Copy `source` to `target` through `modifier` until end of stream.
///
/// Returns the number of bytes delivered to the target. A target that went
/// away (released buffer) ends the copy without error.
pub async fn forward<R>(mut source: R, mut target: ForwardTarget, modifier: StreamModifier) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut state = ModifierState::new(modifier);
    let mut chunk = vec![0u8; FORWARD_CHUNK];
    let mut delivered = 0u64;

    loop {
        let n = match source.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Pipe source failed, treating as end of stream");
                break;
            }
        };
        let out = state.apply(&chunk[..n]);
        match target.send(&out).await {
            Ok(()) => delivered += out.len() as u64,
            Err(e) if e.is_closed() => {
                trace!("Forward target released, stopping");
                return Ok(delivered);
            }
            Err(e) => return Err(e),
        }
    }

    let tail = state.finish();
    match target.send(&tail).await {
        Ok(()) => delivered += tail.len() as u64,
        Err(e) if e.is_closed() => return Ok(delivered),
        Err(e) => return Err(e),
    }
    target.finish().await?;
    trace!(bytes = delivered, "Pipe forward finished");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_forward_to_writer_with_header() {
        let (mut src_tx, src_rx) = tokio::io::duplex(64);
        let (dst_tx, mut dst_rx) = tokio::io::duplex(256);

        tokio::spawn(async move {
            src_tx.write_all(&[1, 2, 3, 4]).await.unwrap();
        });

        let modifier = StreamModifier::Pcm {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            header: Some(Bytes::from_static(b"H")),
        };
        let n = forward(src_rx, ForwardTarget::Writer(Box::new(dst_tx)), modifier)
            .await
            .unwrap();
        assert_eq!(n, 5);

        let mut out = Vec::new();
        dst_rx.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![b'H', 2, 1, 4, 3]);
    }
}
