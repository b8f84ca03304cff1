//! System Clock Reference field of an MPEG-2 program stream pack header.
//!
//! The pack header is `00 00 01 BA` followed by a 6-byte SCR field:
//!
//! ```text
//! b0: 0 1 s32 s31 s30 M s29 s28
//! b1: s27 .. s20
//! b2: s19 .. s15 M s14 s13
//! b3: s12 .. s5
//! b4: s4 .. s0 M e8 e7
//! b5: e6 .. e0 M
//! ```
//!
//! `M` are marker bits (always 1) and `e` is the 9-bit extension, which is
//! carried through untouched.

use crate::clock::shift_timestamp;

/// Pack header start code.
pub const PACK_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xBA];

/// Length of the SCR field following the start code.
pub const SCR_FIELD_LEN: usize = 6;

/// Start code plus SCR field.
pub const SCR_WINDOW_LEN: usize = PACK_START_CODE.len() + SCR_FIELD_LEN;

/// Whether the field carries the MPEG-2 `01` prefix and all marker bits.
pub fn is_valid_scr(field: &[u8; SCR_FIELD_LEN]) -> bool {
    field[0] & 0x80 == 0
        && field[0] & 0x40 != 0
        && field[0] & 0x04 != 0
        && field[2] & 0x04 != 0
        && field[4] & 0x04 != 0
        && field[5] & 0x01 != 0
}

/// Decode the 33-bit SCR base, or `None` when the marker bits don't match.
pub fn decode_scr(field: &[u8; SCR_FIELD_LEN]) -> Option<u64> {
    if !is_valid_scr(field) {
        return None;
    }
    let b = field.map(u64::from);
    let high = (b[0] & 0x38) >> 3;
    let mid = ((b[0] & 0x03) << 13) | (b[1] << 5) | ((b[2] & 0xF8) >> 3);
    let low = ((b[2] & 0x03) << 13) | (b[3] << 5) | ((b[4] & 0xF8) >> 3);
    Some((high << 30) | (mid << 15) | low)
}

/// Write a 33-bit SCR base into `field`, preserving prefix, markers and extension.
pub fn encode_scr(field: &mut [u8; SCR_FIELD_LEN], scr: u64) {
    let high = (scr >> 30) & 0x07;
    let mid = (scr >> 15) & 0x7FFF;
    let low = scr & 0x7FFF;

    field[0] = (field[0] & 0xC4) | ((high << 3) as u8 & 0x38) | ((mid >> 13) as u8 & 0x03);
    field[1] = (mid >> 5) as u8;
    field[2] = (field[2] & 0x04) | ((mid << 3) as u8 & 0xF8) | ((low >> 13) as u8 & 0x03);
    field[3] = (low >> 5) as u8;
    field[4] = (field[4] & 0x07) | ((low << 3) as u8 & 0xF8);
}

/// Shift the SCR in `field` by `delta` clock ticks.
///
/// Returns the new value, or `None` (leaving `field` untouched) when the field
/// is not a valid SCR.
pub fn shift_scr(field: &mut [u8; SCR_FIELD_LEN], delta: i64) -> Option<u64> {
    let scr = decode_scr(field)?;
    let shifted = shift_timestamp(scr, delta);
    encode_scr(field, shifted);
    Some(shifted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{CLOCK_HZ, TIMESTAMP_MASK};

    const TEN_SECONDS: [u8; 6] = [0x44, 0x00, 0xDD, 0xDD, 0x04, 0x01];

    #[test]
    fn test_decode_known_scr() {
        assert_eq!(decode_scr(&TEN_SECONDS), Some(10 * CLOCK_HZ));
    }

    #[test]
    fn test_shift_five_seconds() {
        let mut field = TEN_SECONDS;
        let shifted = shift_scr(&mut field, 5 * CLOCK_HZ as i64);
        assert_eq!(shifted, Some(15 * CLOCK_HZ));
        assert_eq!(field, [0x44, 0x01, 0x4C, 0xCB, 0x84, 0x01]);
        assert_eq!(decode_scr(&field), Some(1_350_000));
    }

    #[test]
    fn test_markers_and_extension_preserved() {
        // extension bits set in b4/b5
        let mut field = [0x44, 0x00, 0x04, 0x00, 0x07, 0xFF];
        encode_scr(&mut field, TIMESTAMP_MASK);
        assert!(is_valid_scr(&field));
        assert_eq!(field[4] & 0x03, 0x03);
        assert_eq!(field[5], 0xFF);
        assert_eq!(decode_scr(&field), Some(TIMESTAMP_MASK));
    }

    #[test]
    fn test_rejects_mpeg1_and_missing_markers() {
        // MPEG-1 pack headers start with 0010
        assert_eq!(decode_scr(&[0x21, 0x00, 0x01, 0x00, 0x01, 0x80]), None);
        let mut broken = TEN_SECONDS;
        broken[2] &= !0x04;
        assert_eq!(decode_scr(&broken), None);
        let before = broken;
        assert_eq!(shift_scr(&mut broken, 90_000), None);
        assert_eq!(broken, before);
    }

    #[test]
    fn test_shift_wraps_in_33_bits() {
        let mut field = [0x44, 0x00, 0x04, 0x00, 0x04, 0x01];
        encode_scr(&mut field, TIMESTAMP_MASK - 10);
        assert_eq!(shift_scr(&mut field, 20), Some(9));
    }
}
