//! Streaming ring buffer between one transcoder and its readers.
//!
//! The writer is the process output (or pipe) forwarder. Readers are
//! streaming requests, each with its own cursor into the same byte sequence.
//! The write cursor may run ahead of the current reader by at most the
//! overflow threshold; beyond that the writer waits. A reader that is not
//! the current one can be overrun, and is told so instead of receiving
//! stale bytes.
//!
//! Waiting on either side is bounded: reads give up after
//! `poll_interval * read_retries` and report [`ReadOutcome::Starved`],
//! writes re-check reader state every `poll_interval`.
//!
//! Timestamp patching runs inside `write`, under the lock, and readers only
//! see bytes the patcher has settled.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use ts_shift::{PatchStats, RingSlice, TimestampPatcher, TimestampShift};

use crate::config::TranscodeConfig;
use crate::error::{Result, TranscodeError};
use crate::params::OutputParams;

mod reader;
mod storage;
mod usage;

pub use reader::BufferReader;
pub use storage::INITIAL_BUFFER_SIZE;
use storage::Storage;

pub const MARGIN_LARGE: usize = 20_000_000;
pub const MARGIN_MEDIUM: usize = 2_000_000;
pub const MARGIN_SMALL: usize = 600_000;

/// Buffers above this size report their usage.
const USAGE_REPORT_MIN_SIZE: usize = 15 * 1_048_576;

/// Receives the amount of buffered data, in whole megabytes.
pub trait BufferObserver: Send + Sync {
    fn on_buffered(&self, megabytes: u64);
}

/// The process a buffer belongs to, as seen from the buffer.
pub trait StopTarget: Send + Sync {
    fn label(&self) -> &str;

    fn set_ready_to_stop(&self, ready: bool);

    fn is_ready_to_stop(&self) -> bool;

    fn is_destroyed(&self) -> bool;

    /// Stop the process. Returns whether this call did the stopping.
    fn stop_process(&self) -> bool;
}

/// What happens when a reader attaches while another one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    /// Every request gets its own reader; the newest one paces the writer.
    AllowMultiple,
    /// The first reader keeps the stream, later requests are refused.
    KeepFirst,
    /// A new request closes all existing readers and takes over.
    ForceReconnect,
}

impl ConnectionPolicy {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        match (config.block_multiple_connections, config.keep_first_connection) {
            (false, _) => Self::AllowMultiple,
            (true, true) => Self::KeepFirst,
            (true, false) => Self::ForceReconnect,
        }
    }
}

/// Result of one [`RingBuffer::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied.
    Data(usize),
    /// The stream ended and the reader has everything.
    Eof,
    /// No data within the retry budget. Not the end of the stream.
    Starved,
}

#[derive(Clone)]
pub struct BufferSettings {
    /// Data (bytes) the first read of a reader waits for
    pub min_read: usize,
    /// Data (bytes) later reads wait for
    pub second_read: usize,
    pub max_size: usize,
    pub policy: ConnectionPolicy,
    pub shift: Option<TimestampShift>,
    /// Leading bytes (a stream header) the timestamp patcher skips
    pub header_len: u64,
    pub hide_usage: bool,
    /// Start the detach sequence when the stream is closed
    pub cleanup: bool,
    pub poll_interval: Duration,
    pub read_retries: u32,
    pub cleanup_delay: Duration,
    pub usage_interval: Duration,
    /// Consecutive starved reads after which a byte stream fails
    pub stream_idle_reads: u32,
    /// Copy of everything written, opened on the first write
    pub debug_dump: Option<PathBuf>,
    pub observer: Option<Arc<dyn BufferObserver>>,
    pub available_memory: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl BufferSettings {
    /// `max_size` bytes, everything else from the default configuration.
    pub fn new(max_size: usize) -> Self {
        let config = TranscodeConfig::default();
        Self {
            min_read: 0,
            second_read: 0,
            max_size,
            policy: ConnectionPolicy::AllowMultiple,
            shift: None,
            header_len: 0,
            hide_usage: false,
            cleanup: false,
            poll_interval: config.poll_interval(),
            read_retries: config.read_retries,
            cleanup_delay: config.cleanup_delay(),
            usage_interval: config.usage_report_interval(),
            stream_idle_reads: config.stream_idle_reads,
            debug_dump: None,
            observer: None,
            available_memory: Arc::new(crate::platform::available_memory),
        }
    }

    pub fn from_params(params: &OutputParams, config: &TranscodeConfig) -> Self {
        let shift = if config.timestamp_patching {
            TimestampShift::from_seek(params.time_seek, params.time_end, params.shift_scr)
        } else {
            None
        };
        Self {
            min_read: params.min_buffer_bytes(),
            second_read: params.second_read_min_size,
            max_size: params.max_buffer_bytes(),
            policy: ConnectionPolicy::from_config(config),
            shift,
            header_len: params.header.as_ref().map_or(0, |header| header.len() as u64),
            hide_usage: params.hide_buffer,
            cleanup: params.cleanup,
            poll_interval: config.poll_interval(),
            read_retries: config.read_retries,
            cleanup_delay: config.cleanup_delay(),
            usage_interval: config.usage_report_interval(),
            stream_idle_reads: config.stream_idle_reads,
            debug_dump: params.debug_dump.clone(),
            observer: params.observer.clone(),
            available_memory: Arc::new(crate::platform::available_memory),
        }
    }

    pub fn with_min_read(mut self, first: usize, second: usize) -> Self {
        self.min_read = first;
        self.second_read = second;
        self
    }

    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_shift(mut self, shift: Option<TimestampShift>) -> Self {
        self.shift = shift;
        self
    }

    pub fn with_header_len(mut self, len: u64) -> Self {
        self.header_len = len;
        self
    }

    pub fn with_polling(mut self, interval: Duration, retries: u32) -> Self {
        self.poll_interval = interval;
        self.read_retries = retries;
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool, delay: Duration) -> Self {
        self.cleanup = cleanup;
        self.cleanup_delay = delay;
        self
    }

    pub fn with_usage_report(mut self, hide: bool, interval: Duration) -> Self {
        self.hide_usage = hide;
        self.usage_interval = interval;
        self
    }

    /// Starved reads in a row after which [`BufferReader::into_stream`]
    /// fails with `io::ErrorKind::TimedOut`. With the default of 4 a
    /// live stream that stalls for `4 * poll_interval * read_retries` ends;
    /// raise it for sources with long gaps.
    pub fn with_stream_idle_reads(mut self, reads: u32) -> Self {
        self.stream_idle_reads = reads;
        self
    }

    pub fn with_debug_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_dump = Some(path.into());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BufferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_memory_probe(mut self, probe: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.available_memory = Arc::new(probe);
        self
    }

    fn read_timeout(&self) -> Duration {
        self.poll_interval.saturating_mul(self.read_retries)
    }
}

/// How far the writer may run ahead of the current reader.
pub fn overflow_threshold(capacity: usize) -> usize {
    let margin = if capacity < MARGIN_MEDIUM {
        MARGIN_SMALL
    } else if capacity < MARGIN_LARGE {
        MARGIN_MEDIUM
    } else {
        MARGIN_LARGE
    };
    let margin = if margin >= capacity { capacity / 4 } else { margin };
    capacity - margin
}

struct ReaderSlot {
    id: u64,
    read_pos: u64,
    first_read: bool,
}

struct State {
    storage: Option<Storage>,
    write_pos: u64,
    eof: bool,
    released: bool,
    threshold: usize,
    readers: Vec<ReaderSlot>,
    next_reader: u64,
    patcher: Option<TimestampPatcher>,
}

impl State {
    fn modulus(&self) -> usize {
        self.storage.as_ref().map_or(0, Storage::len)
    }

    /// Oldest position still held by the ring.
    fn oldest(&self) -> u64 {
        self.write_pos.saturating_sub(self.modulus() as u64)
    }

    /// Bytes readers may see.
    fn visible(&self) -> u64 {
        match &self.patcher {
            Some(patcher) => patcher.settled(self.write_pos, self.eof),
            None => self.write_pos,
        }
    }

    fn current_reader(&self, policy: ConnectionPolicy) -> Option<&ReaderSlot> {
        match policy {
            ConnectionPolicy::KeepFirst => self.readers.first(),
            _ => self.readers.last(),
        }
    }

    /// Bytes the writer may add right now.
    fn write_allowance(&self, policy: ConnectionPolicy) -> usize {
        let reference = self.current_reader(policy).map_or(0, |r| r.read_pos);
        let gap = self.write_pos.saturating_sub(reference);
        (self.threshold as u64).saturating_sub(gap) as usize
    }

    fn slot_mut(&mut self, id: u64) -> Option<&mut ReaderSlot> {
        self.readers.iter_mut().find(|r| r.id == id)
    }

    fn add_reader(&mut self, read_pos: u64) -> u64 {
        let id = self.next_reader;
        self.next_reader += 1;
        self.readers.push(ReaderSlot {
            id,
            read_pos,
            first_read: true,
        });
        id
    }

    fn copy_in(&mut self, data: &[u8]) {
        let Some(storage) = self.storage.as_mut() else {
            return;
        };
        let modulus = storage.len();
        let start = self.write_pos;
        let at = (start % modulus as u64) as usize;
        let first = data.len().min(modulus - at);
        let ring = storage.as_mut_slice();
        ring[at..at + first].copy_from_slice(&data[..first]);
        ring[..data.len() - first].copy_from_slice(&data[first..]);
        self.write_pos += data.len() as u64;

        if let Some(patcher) = self.patcher.as_mut() {
            if let Some(mut slice) = RingSlice::new(storage.as_mut_slice(), modulus) {
                patcher.on_write(&mut slice, start, self.write_pos);
            }
        }
    }

    fn copy_out(&self, from: u64, buf: &mut [u8]) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let modulus = storage.len();
        let at = (from % modulus as u64) as usize;
        let first = buf.len().min(modulus - at);
        let ring = storage.as_slice();
        buf[..first].copy_from_slice(&ring[at..at + first]);
        let rest = buf.len() - first;
        buf[first..].copy_from_slice(&ring[..rest]);
    }
}

enum DebugDump {
    Disabled,
    Pending(PathBuf),
    Open(tokio::fs::File),
    /// Taken by a writer for the duration of one copy
    Busy,
}

pub struct RingBuffer {
    settings: BufferSettings,
    state: Mutex<State>,
    /// Signalled after every write, close and reset
    written: Notify,
    /// Signalled after every read and reader change
    drained: Notify,
    owner: Mutex<Option<Weak<dyn StopTarget>>>,
    dump: Mutex<DebugDump>,
    usage_cancel: CancellationToken,
}

impl RingBuffer {
    pub fn new(settings: BufferSettings) -> Result<Arc<Self>> {
        let probe = settings.available_memory.clone();
        let storage = Storage::allocate(settings.max_size, || probe())?;
        let threshold = overflow_threshold(storage.target());
        trace!(capacity = storage.target(), allocated = storage.len(), threshold, "Created ring buffer");

        let dump = match &settings.debug_dump {
            Some(path) => DebugDump::Pending(path.clone()),
            None => DebugDump::Disabled,
        };
        let patcher = settings
            .shift
            .map(|shift| TimestampPatcher::starting_at(shift, settings.header_len));

        Ok(Arc::new(Self {
            state: Mutex::new(State {
                storage: Some(storage),
                write_pos: 0,
                eof: false,
                released: false,
                threshold,
                readers: Vec::new(),
                next_reader: 0,
                patcher,
            }),
            settings,
            written: Notify::new(),
            drained: Notify::new(),
            owner: Mutex::new(None),
            dump: Mutex::new(dump),
            usage_cancel: CancellationToken::new(),
        }))
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    /// Capacity the ring wraps at once fully grown.
    pub fn capacity(&self) -> usize {
        self.state.lock().storage.as_ref().map_or(0, Storage::target)
    }

    /// Total bytes ever written.
    pub fn write_position(&self) -> u64 {
        self.state.lock().write_pos
    }

    /// Total bytes readers can see.
    pub fn visible_position(&self) -> u64 {
        self.state.lock().visible()
    }

    pub fn threshold(&self) -> usize {
        self.state.lock().threshold
    }

    pub fn is_eof(&self) -> bool {
        self.state.lock().eof
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// Bytes written but not yet read by the current reader.
    pub fn buffered_bytes(&self) -> u64 {
        let state = self.state.lock();
        let read = state.current_reader(self.settings.policy).map_or(0, |r| r.read_pos);
        state.write_pos.saturating_sub(read)
    }

    pub fn patch_stats(&self) -> Option<PatchStats> {
        self.state.lock().patcher.as_ref().map(TimestampPatcher::stats)
    }

    /// Bind the buffer to the process feeding it. Starts usage reporting.
    pub fn attach_owner(self: &Arc<Self>, owner: Weak<dyn StopTarget>) -> Result<()> {
        {
            let mut slot = self.owner.lock();
            if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
                return Err(TranscodeError::Other(format!(
                    "buffer is already attached to {}",
                    existing.label()
                )));
            }
            *slot = Some(owner);
        }
        if !self.settings.hide_usage && self.capacity() > USAGE_REPORT_MIN_SIZE {
            usage::spawn_reporter(self);
        }
        Ok(())
    }

    fn owner(&self) -> Option<Arc<dyn StopTarget>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    fn mark_active(&self) {
        if let Some(owner) = self.owner() {
            owner.set_ready_to_stop(false);
        }
    }

    /// Append `data`, waiting while the current reader is too far behind.
    ///
    /// Fails with [`TranscodeError::BufferReleased`] once the buffer is
    /// closed or reset; nothing written before that is lost.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.copy_to_dump(data).await;

        let mut offset = 0;
        let mut waiting = false;
        while offset < data.len() {
            let drained = self.drained.notified();
            {
                let mut state = self.state.lock();
                if state.eof || state.released {
                    return Err(TranscodeError::BufferReleased);
                }
                let remaining = data.len() - offset;
                let probe = &self.settings.available_memory;
                let end = state.write_pos + remaining as u64;
                let grown = state.storage.as_mut().and_then(|storage| {
                    let before = storage.target();
                    storage.ensure(end, || probe());
                    (storage.target() != before).then(|| storage.target())
                });
                if let Some(target) = grown {
                    state.threshold = overflow_threshold(target);
                }

                let allowance = state.write_allowance(self.settings.policy);
                if allowance > 0 {
                    if waiting {
                        trace!(write_pos = state.write_pos, "Resume write");
                        waiting = false;
                    }
                    let n = allowance.min(remaining);
                    state.copy_in(&data[offset..offset + n]);
                    offset += n;
                    drop(state);
                    self.written.notify_waiters();
                    continue;
                }
                if !waiting {
                    trace!(write_pos = state.write_pos, threshold = state.threshold, "Suspend write, reader is behind");
                    waiting = true;
                }
            }
            // readers may come and go without draining, so re-check periodically
            let _ = tokio::time::timeout(self.settings.poll_interval, drained).await;
        }
        Ok(())
    }

    /// Whether a debug copy is still being written.
    pub fn is_dumping(&self) -> bool {
        !matches!(*self.dump.lock(), DebugDump::Disabled)
    }

    async fn copy_to_dump(&self, data: &[u8]) {
        let taken = {
            let mut slot = self.dump.lock();
            match &*slot {
                DebugDump::Disabled | DebugDump::Busy => return,
                _ if self.is_released() => {
                    *slot = DebugDump::Disabled;
                    return;
                }
                _ => std::mem::replace(&mut *slot, DebugDump::Busy),
            }
        };
        let mut file = match taken {
            DebugDump::Open(file) => file,
            DebugDump::Pending(path) => match tokio::fs::File::create(&path).await {
                Ok(file) => {
                    debug!(path = %path.display(), "Copying buffered output to debug file");
                    file
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot create debug copy, continuing without it");
                    *self.dump.lock() = DebugDump::Disabled;
                    return;
                }
            },
            DebugDump::Disabled | DebugDump::Busy => return,
        };

        let result = async {
            file.write_all(data).await?;
            file.flush().await
        }
        .await;

        // a reset while the copy was running only sees `Busy`, so the file
        // is dropped here instead
        let mut slot = self.dump.lock();
        *slot = match result {
            Ok(()) if !self.is_released() => DebugDump::Open(file),
            Ok(()) => DebugDump::Disabled,
            Err(e) => {
                warn!(error = %e, "Debug copy failed, disabling it");
                DebugDump::Disabled
            }
        };
    }

    /// Attach a reader starting at byte `start_offset` of the stream.
    ///
    /// An offset of 0 starts at the oldest byte still buffered; an offset
    /// that has already been overwritten is moved forward to it. Returns
    /// `None` when the connection policy refuses another reader.
    pub fn attach_reader(self: &Arc<Self>, start_offset: u64) -> Option<BufferReader> {
        self.mark_active();
        let id = {
            let mut state = self.state.lock();
            if !state.readers.is_empty() {
                match self.settings.policy {
                    ConnectionPolicy::AllowMultiple => {}
                    ConnectionPolicy::KeepFirst => {
                        debug!(readers = state.readers.len(), "Buffer already has a reader, refusing another");
                        return None;
                    }
                    ConnectionPolicy::ForceReconnect => {
                        debug!(readers = state.readers.len(), "Closing existing readers for a new connection");
                        state.readers.clear();
                    }
                }
            }
            let oldest = state.oldest();
            let start = if start_offset == 0 {
                oldest
            } else if start_offset < oldest {
                warn!(start_offset, oldest, "Requested offset already overwritten, starting at oldest buffered byte");
                oldest
            } else {
                debug!(start_offset, "Setting reader position");
                start_offset
            };
            state.add_reader(start)
        };
        self.drained.notify_waiters();
        self.written.notify_waiters();
        Some(BufferReader::new(self.clone(), id))
    }

    /// Read up to `buf.len()` bytes for reader `id`.
    pub async fn read(&self, id: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        self.mark_active();
        let deadline = Instant::now() + self.settings.read_timeout();
        let mut suspended = false;
        loop {
            let written = self.written.notified();
            {
                let mut state = self.state.lock();
                if state.released {
                    return Ok(ReadOutcome::Eof);
                }
                let capacity = state.storage.as_ref().map_or(0, Storage::target);
                let oldest = state.oldest();
                let visible = state.visible();
                let eof = state.eof;
                let threshold = state.threshold;
                let slot = state.slot_mut(id).ok_or(TranscodeError::ReaderClosed)?;
                let read_pos = slot.read_pos;

                if read_pos < oldest {
                    return Err(TranscodeError::Overrun {
                        requested: read_pos,
                        oldest,
                    });
                }
                if eof && read_pos >= visible {
                    return Ok(ReadOutcome::Eof);
                }

                let available = visible.saturating_sub(read_pos);
                let minimum = if slot.first_read {
                    self.settings.min_read
                } else {
                    self.settings.second_read
                };
                let required = minimum.min(threshold / 2) as u64;
                let timed_out = Instant::now() >= deadline;

                if available > required || eof || (timed_out && available > 0) {
                    let n = (available.min(buf.len() as u64)) as usize;
                    slot.read_pos += n as u64;
                    slot.first_read = false;
                    if suspended {
                        trace!(read_pos, write_pos = state.write_pos, "Resume read");
                    }
                    if read_pos > INITIAL_BUFFER_SIZE as u64 && read_pos < capacity as u64 {
                        let relaxed = capacity.saturating_sub(MARGIN_MEDIUM);
                        if state.threshold != relaxed {
                            debug!(threshold = relaxed, "Reader past initial allocation, narrowing margin");
                            state.threshold = relaxed;
                        }
                    }
                    state.copy_out(read_pos, &mut buf[..n]);
                    drop(state);
                    self.drained.notify_waiters();
                    return Ok(ReadOutcome::Data(n));
                }
                if timed_out {
                    trace!(read_pos, available, "Read gave up waiting for data");
                    return Ok(ReadOutcome::Starved);
                }
                if !suspended {
                    trace!(read_pos, write_pos = state.write_pos, "Suspend read");
                    suspended = true;
                }
            }
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(self.settings.poll_interval);
            let _ = tokio::time::timeout(wait, written).await;
        }
    }

    /// Current cursor of reader `id`, if it is still attached.
    pub fn reader_position(&self, id: u64) -> Option<u64> {
        self.state.lock().readers.iter().find(|r| r.id == id).map(|r| r.read_pos)
    }

    /// Drop reader `id`. Detaches the buffer when it was the last one.
    pub fn close_reader(self: &Arc<Self>, id: u64) {
        let remaining = {
            let mut state = self.state.lock();
            let before = state.readers.len();
            state.readers.retain(|r| r.id != id);
            if state.readers.len() == before {
                return;
            }
            state.readers.len()
        };
        trace!(reader = id, remaining, "Reader closed");
        self.drained.notify_waiters();
        if remaining == 0 {
            self.detach();
        }
    }

    /// Mark the process ready to stop and, after the cleanup delay, stop it
    /// and release the buffer unless a reader came back in the meantime.
    pub fn detach(self: &Arc<Self>) {
        let Some(owner) = self.owner() else {
            return;
        };
        owner.set_ready_to_stop(true);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(process = owner.label(), "No runtime for deferred cleanup");
            return;
        };
        let buffer = Arc::downgrade(self);
        let owner = Arc::downgrade(&owner);
        let delay = self.settings.cleanup_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let (Some(buffer), Some(owner)) = (buffer.upgrade(), owner.upgrade()) else {
                return;
            };
            if owner.is_ready_to_stop() {
                if !owner.is_destroyed() {
                    debug!(process = owner.label(), "No reader came back, stopping process");
                    owner.stop_process();
                }
                buffer.reset();
            }
        });
    }

    /// Mark the end of the stream. Readers drain what is left, then see
    /// [`ReadOutcome::Eof`].
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.eof {
                return;
            }
            trace!(write_pos = state.write_pos, "EOF");
            state.eof = true;
            let write_pos = state.write_pos;
            let State {
                storage, patcher, ..
            } = &mut *state;
            if let (Some(patcher), Some(storage)) = (patcher.as_mut(), storage.as_mut()) {
                let modulus = storage.len();
                if let Some(mut slice) = RingSlice::new(storage.as_mut_slice(), modulus) {
                    patcher.finish(&mut slice, write_pos);
                }
            }
        }
        self.written.notify_waiters();
        self.drained.notify_waiters();
        if self.settings.cleanup {
            self.detach();
        }
    }

    /// Release the backing memory and wake everyone up. Idempotent.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            trace!("Destroying buffer");
            state.eof = true;
            state.released = true;
            state.storage = None;
        }
        {
            let mut dump = self.dump.lock();
            if !matches!(*dump, DebugDump::Busy) {
                *dump = DebugDump::Disabled;
            }
        }
        self.usage_cancel.cancel();
        if let Some(observer) = &self.settings.observer {
            observer.on_buffered(0);
        }
        self.written.notify_waiters();
        self.drained.notify_waiters();
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &state.modulus())
            .field("write_pos", &state.write_pos)
            .field("readers", &state.readers.len())
            .field("eof", &state.eof)
            .field("released", &state.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(100_000_000, 80_000_000)]
    #[case(10_000_000, 8_000_000)]
    #[case(1_048_576, 448_576)]
    // margins larger than the buffer fall back to a quarter
    #[case(500_000, 375_000)]
    #[case(16, 12)]
    fn test_overflow_threshold_tiers(#[case] capacity: usize, #[case] expected: usize) {
        assert_eq!(overflow_threshold(capacity), expected);
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = TranscodeConfig::default();
        assert_eq!(ConnectionPolicy::from_config(&config), ConnectionPolicy::AllowMultiple);
        config.block_multiple_connections = true;
        assert_eq!(ConnectionPolicy::from_config(&config), ConnectionPolicy::ForceReconnect);
        config.keep_first_connection = true;
        assert_eq!(ConnectionPolicy::from_config(&config), ConnectionPolicy::KeepFirst);
    }

    #[test]
    fn test_settings_from_params() {
        let config = TranscodeConfig::default();
        let params = OutputParams::new()
            .with_buffer_size(0.5, 2.0)
            .with_time_range(10.0, 0.0)
            .with_shift_scr(true)
            .with_header(&b"HEAD:"[..]);
        let settings = BufferSettings::from_params(&params, &config);
        assert_eq!(settings.max_size, 2 * 1_048_576);
        assert_eq!(settings.min_read, 524_288);
        assert_eq!(settings.header_len, 5);
        let shift = settings.shift.unwrap();
        assert!(shift.patches_scr() && shift.patches_pes());

        let config = TranscodeConfig {
            timestamp_patching: false,
            ..TranscodeConfig::default()
        };
        assert!(BufferSettings::from_params(&params, &config).shift.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_wraps() {
        let buffer = RingBuffer::new(BufferSettings::new(16)).unwrap();
        let mut reader = buffer.attach_reader(0).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        for round in 0u8..6 {
            let chunk: Vec<u8> = (0..7).map(|i| round * 7 + i).collect();
            buffer.write(&chunk).await.unwrap();
            while out.len() < (round as usize + 1) * 7 {
                match reader.read(&mut buf).await.unwrap() {
                    ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
        assert_eq!(out, (0u8..42).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let buffer = RingBuffer::new(BufferSettings::new(64)).unwrap();
        let mut reader = buffer.attach_reader(0).unwrap();
        buffer.reset();
        buffer.reset();
        assert!(buffer.is_released());
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(reader.read(&mut [0u8; 4]).await.unwrap(), ReadOutcome::Eof);
        assert!(matches!(
            buffer.write(b"late").await,
            Err(TranscodeError::BufferReleased)
        ));
    }
}
