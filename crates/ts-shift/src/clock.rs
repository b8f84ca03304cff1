//! 90 kHz MPEG system clock arithmetic.

/// MPEG system clock base frequency.
pub const CLOCK_HZ: u64 = 90_000;

/// Mask for the 33-bit timestamp space shared by SCR, PTS and DTS.
pub const TIMESTAMP_MASK: u64 = (1 << 33) - 1;

const TIMESTAMP_MODULUS: i64 = 1 << 33;

/// Convert a shift in seconds to clock ticks, truncating toward zero.
pub fn ticks_from_seconds(seconds: f64) -> i64 {
    if !seconds.is_finite() {
        return 0;
    }
    (seconds * CLOCK_HZ as f64) as i64
}

/// Add `delta` ticks to a 33-bit timestamp, wrapping inside the 33-bit space.
pub fn shift_timestamp(timestamp: u64, delta: i64) -> u64 {
    let base = (timestamp & TIMESTAMP_MASK) as i64;
    base.wrapping_add(delta).rem_euclid(TIMESTAMP_MODULUS) as u64
}

/// Convert ticks to seconds.
pub fn seconds_from_ticks(ticks: u64) -> f64 {
    ticks as f64 / CLOCK_HZ as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_from_seconds() {
        assert_eq!(ticks_from_seconds(1.0), 90_000);
        assert_eq!(ticks_from_seconds(2.5), 225_000);
        assert_eq!(ticks_from_seconds(0.0), 0);
        assert_eq!(ticks_from_seconds(f64::NAN), 0);
    }

    #[test]
    fn test_shift_wraps_33_bits() {
        assert_eq!(shift_timestamp(TIMESTAMP_MASK, 1), 0);
        assert_eq!(shift_timestamp(0, -1), TIMESTAMP_MASK);
        assert_eq!(shift_timestamp(90_000, 90_000), 180_000);
    }

    #[test]
    fn test_seconds_from_ticks() {
        assert!((seconds_from_ticks(45_000) - 0.5).abs() < 1e-9);
    }
}
