//! A single consumer's view of a [`RingBuffer`].

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use super::{ReadOutcome, RingBuffer};
use crate::error::Result;

const STREAM_CHUNK: usize = 64 * 1024;

/// Cursor into a ring buffer. Closing it (or dropping it) removes it from
/// the buffer; the last reader to leave starts the buffer's detach sequence.
#[derive(Debug)]
pub struct BufferReader {
    buffer: Arc<RingBuffer>,
    id: u64,
    closed: bool,
}

impl BufferReader {
    pub(super) fn new(buffer: Arc<RingBuffer>, id: u64) -> Self {
        Self {
            buffer,
            id,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// Bytes delivered so far, counted from the start of the stream.
    /// `None` once the reader was closed, by us or by a newer connection.
    pub fn position(&self) -> Option<u64> {
        self.buffer.reader_position(self.id)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        self.buffer.read(self.id, buf).await
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buffer.close_reader(self.id);
        }
    }

    /// Chunks until end of stream. Fails with `TimedOut` after
    /// `stream_idle_reads` consecutive starved reads, so a live source that
    /// stalls for longer than that ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send {
        let idle_limit = self.buffer.settings().stream_idle_reads.max(1);
        let state = Some((self, BytesMut::with_capacity(STREAM_CHUNK)));
        futures::stream::unfold(state, move |state| async move {
            let (mut reader, mut chunk) = state?;
            let mut idle = 0;
            chunk.resize(STREAM_CHUNK, 0);
            loop {
                match reader.read(&mut chunk).await {
                    Ok(ReadOutcome::Data(n)) => {
                        chunk.truncate(n);
                        let data = chunk.split().freeze();
                        return Some((Ok(data), Some((reader, chunk))));
                    }
                    Ok(ReadOutcome::Eof) => return None,
                    Ok(ReadOutcome::Starved) => {
                        idle += 1;
                        if idle >= idle_limit {
                            let err = io::Error::new(io::ErrorKind::TimedOut, "no data from transcoder");
                            return Some((Err(err), None));
                        }
                    }
                    Err(e) => return Some((Err(io::Error::other(e)), None)),
                }
            }
        })
    }

    pub fn into_async_read(self) -> impl AsyncRead + Send {
        StreamReader::new(Box::pin(self.into_stream()))
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        self.close();
    }
}
