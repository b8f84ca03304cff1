//! Backing array of the ring buffer.
//!
//! Large buffers start with [`INITIAL_BUFFER_SIZE`] bytes and grow once to
//! their full size when the first lap is about to run past the initial
//! allocation. Growth only ever happens before the first wrap, so positions
//! already written keep their index.

use tracing::{debug, trace};

use crate::error::{Result, TranscodeError};

/// First allocation for buffers larger than this.
pub const INITIAL_BUFFER_SIZE: usize = 52_428_800;

/// Share of available memory used when a requested allocation fails.
const FALLBACK_NUMERATOR: u64 = 3;
const FALLBACK_DENOMINATOR: u64 = 10;

pub(crate) struct Storage {
    data: Vec<u8>,
    /// Size the ring will settle at
    target: usize,
}

impl Storage {
    pub(crate) fn allocate(max: usize, available_memory: impl FnOnce() -> u64) -> Result<Self> {
        let initial = max.min(INITIAL_BUFFER_SIZE);
        let data = grow(Vec::new(), initial, available_memory);
        if data.is_empty() {
            return Err(TranscodeError::Allocation { requested: initial });
        }
        // a short initial allocation is final: the ring cannot rely on more
        let target = if data.len() < initial { data.len() } else { max };
        Ok(Self { data, target })
    }

    /// Current modulus of ring positions.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn target(&self) -> usize {
        self.target
    }

    /// Grow to the target before a write ending at `write_end` wraps the
    /// initial allocation.
    pub(crate) fn ensure(&mut self, write_end: u64, available_memory: impl FnOnce() -> u64) {
        if self.data.len() >= self.target || write_end <= self.data.len() as u64 {
            return;
        }
        let before = self.data.len();
        let data = std::mem::take(&mut self.data);
        self.data = grow(data, self.target, available_memory);
        // whatever we got is what the ring wraps at from now on
        self.target = self.data.len();
        if self.data.len() > before {
            trace!(from = before, to = self.data.len(), "Grew buffer");
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Resize `data` to `new_size` bytes, falling back to a share of available
/// memory when that fails. Never shrinks.
fn grow(mut data: Vec<u8>, new_size: usize, available_memory: impl FnOnce() -> u64) -> Vec<u8> {
    if new_size <= data.len() {
        return data;
    }
    if data.try_reserve_exact(new_size - data.len()).is_ok() {
        data.resize(new_size, 0);
        return data;
    }
    debug!(from = data.len(), to = new_size, "Cannot allocate buffer, trying a smaller size");

    let realistic = (available_memory() / FALLBACK_DENOMINATOR * FALLBACK_NUMERATOR).min(usize::MAX as u64) as usize;
    // never smaller than what we already have, never larger than asked
    let realistic = realistic.min(new_size);
    if realistic <= data.len() {
        return data;
    }
    match data.try_reserve_exact(realistic - data.len()) {
        Ok(()) => data.resize(realistic, 0),
        Err(e) => debug!(from = data.len(), to = realistic, error = %e, "Cannot allocate fallback buffer either"),
    }
    data
}
