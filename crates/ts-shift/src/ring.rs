//! Wrapping access to a circular backing array.
//!
//! Scan offsets are computed as `index - k` for small `k`, which can go
//! negative right after the ring wraps, so every index goes through
//! [`modulo`] rather than `%`.

/// Remainder of `number / divisor` that is always in `0..divisor`.
///
/// `divisor` must be non-zero.
#[inline]
pub fn modulo(number: i64, divisor: usize) -> usize {
    number.rem_euclid(divisor as i64) as usize
}

/// A view over a ring buffer's backing array.
///
/// `modulus` is the ring's logical capacity. The backing slice may be shorter
/// while the ring has not grown to full size yet; positions past its end read
/// as `None` and are never written.
pub struct RingSlice<'a> {
    data: &'a mut [u8],
    modulus: usize,
}

impl<'a> RingSlice<'a> {
    /// Returns `None` when either the slice or the modulus is empty.
    pub fn new(data: &'a mut [u8], modulus: usize) -> Option<Self> {
        if data.is_empty() || modulus == 0 {
            return None;
        }
        Some(Self { data, modulus })
    }

    pub fn modulus(&self) -> usize {
        self.modulus
    }

    /// Position of `index` inside the backing array.
    #[inline]
    pub fn position(&self, index: i64) -> usize {
        modulo(index, self.modulus)
    }

    #[inline]
    pub fn get(&self, index: i64) -> Option<u8> {
        self.data.get(self.position(index)).copied()
    }

    #[inline]
    pub fn set(&mut self, index: i64, value: u8) {
        let pos = self.position(index);
        if let Some(slot) = self.data.get_mut(pos) {
            *slot = value;
        }
    }

    /// Copy `N` consecutive (wrapping) bytes starting at `start`.
    pub fn read_array<const N: usize>(&self, start: i64) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.get(start + i as i64)?;
        }
        Some(out)
    }

    /// Write `bytes` consecutively (wrapping) starting at `start`.
    pub fn write_slice(&mut self, start: i64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.set(start + i as i64, *b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulo_is_never_negative() {
        assert_eq!(modulo(-1, 16), 15);
        assert_eq!(modulo(-17, 16), 15);
        assert_eq!(modulo(-16, 16), 0);
        assert_eq!(modulo(5, 16), 5);
        assert_eq!(modulo(33, 16), 1);
    }

    #[test]
    fn test_ring_slice_wraps_both_ways() {
        let mut data = [0u8; 8];
        let mut ring = RingSlice::new(&mut data, 8).unwrap();
        ring.write_slice(6, &[1, 2, 3, 4]);
        assert_eq!(ring.read_array::<4>(-2), Some([1, 2, 3, 4]));
        assert_eq!(data, [3, 4, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_short_backing_reads_none_past_end() {
        let mut data = [7u8; 4];
        let ring = RingSlice::new(&mut data, 8).unwrap();
        assert_eq!(ring.get(3), Some(7));
        assert_eq!(ring.get(5), None);
        assert!(ring.read_array::<3>(2).is_none());
    }

    #[test]
    fn test_empty_ring_rejected() {
        let mut data: [u8; 0] = [];
        assert!(RingSlice::new(&mut data, 8).is_none());
        let mut data = [0u8; 2];
        assert!(RingSlice::new(&mut data, 0).is_none());
    }
}
