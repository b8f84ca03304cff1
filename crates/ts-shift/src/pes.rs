//! PES header detection and the 5-byte PTS/DTS field codec.

use crate::clock::{TIMESTAMP_MASK, shift_timestamp};

/// Video stream (first of the 0xE0..=0xEF range)
pub const STREAM_ID_VIDEO: u8 = 0xE0;
/// Extended stream id, used by tsMuxeR for VC-1 video
pub const STREAM_ID_EXTENDED: u8 = 0xFD;
/// Private stream 1 (AC-3, DTS, LPCM)
pub const STREAM_ID_PRIVATE_1: u8 = 0xBD;
/// MPEG audio stream (first of the 0xC0..=0xDF range)
pub const STREAM_ID_AUDIO: u8 = 0xC0;

/// Length of a PTS or DTS field.
pub const TIMESTAMP_FIELD_LEN: usize = 5;

/// Offset of the PTS field from the PES start code.
pub const PTS_OFFSET: usize = 9;
/// Offset of the DTS field from the PES start code.
pub const DTS_OFFSET: usize = PTS_OFFSET + TIMESTAMP_FIELD_LEN;

/// Header bytes needed to patch a video PES (start code through DTS).
pub const VIDEO_HEADER_LEN: usize = DTS_OFFSET + TIMESTAMP_FIELD_LEN;
/// Header bytes needed to patch an audio PES (start code through PTS).
pub const AUDIO_HEADER_LEN: usize = PTS_OFFSET + TIMESTAMP_FIELD_LEN;

/// Prefix nibble of a DTS field, and of a PTS field when no DTS follows.
pub const PREFIX_DTS: u8 = 0x1;
/// Prefix nibble of a PTS field.
pub const PREFIX_PTS: u8 = 0x2;

const NEGATIVE_MARKER: u8 = 0x0F;
const NEGATIVE_MAGNITUDE_MASK: u64 = (1 << 30) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesKind {
    Video,
    Audio,
}

fn has_start_code(header: &[u8]) -> bool {
    header.len() >= 4 && header[0] == 0x00 && header[1] == 0x00 && header[2] == 0x01
}

/// Video PES carrying a PTS: stream id 0xE0 or 0xFD, PTS flag set, PTS prefix `001x`.
pub fn is_video_pes(header: &[u8]) -> bool {
    header.len() >= PTS_OFFSET + 1
        && has_start_code(header)
        && matches!(header[3], STREAM_ID_VIDEO | STREAM_ID_EXTENDED)
        && header[7] & 0x80 != 0
        && header[PTS_OFFSET] & 0x20 != 0
}

/// Audio PES carrying a PTS: stream id 0xBD or 0xC0, PTS flag set.
pub fn is_audio_pes(header: &[u8]) -> bool {
    header.len() >= 8
        && has_start_code(header)
        && matches!(header[3], STREAM_ID_PRIVATE_1 | STREAM_ID_AUDIO)
        && header[7] & 0x80 != 0
}

/// Whether the PES header flags announce a DTS after the PTS.
pub fn has_dts(header: &[u8]) -> bool {
    header.len() >= 8 && header[7] & 0x40 != 0
}

/// Classify the PES header at the start of `header`, video first.
pub fn classify(header: &[u8]) -> Option<PesKind> {
    if is_video_pes(header) {
        Some(PesKind::Video)
    } else if is_audio_pes(header) {
        Some(PesKind::Audio)
    } else {
        None
    }
}

/// Decode a 33-bit timestamp.
///
/// Layout: `[prefix(4) | ts32..30 | 1 | ts29..15 | 1 | ts14..0 | 1]`
pub fn decode_timestamp(field: &[u8; TIMESTAMP_FIELD_LEN]) -> u64 {
    let b = field.map(u64::from);
    (((b[0] >> 1) & 0x07) << 30)
        | (b[1] << 22)
        | (((b[2] >> 1) & 0x7F) << 15)
        | (b[3] << 7)
        | ((b[4] >> 1) & 0x7F)
}

/// Encode a 33-bit timestamp with the given 4-bit prefix and all marker bits set.
pub fn encode_timestamp(timestamp: u64, prefix: u8) -> [u8; TIMESTAMP_FIELD_LEN] {
    let ts = timestamp & TIMESTAMP_MASK;
    [
        ((prefix & 0x0F) << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 0x01,
        (ts >> 22) as u8,
        (((ts >> 15) as u8 & 0x7F) << 1) | 0x01,
        (ts >> 7) as u8,
        ((ts as u8 & 0x7F) << 1) | 0x01,
    ]
}

/// A decoded DTS.
///
/// Some muxers write a DTS that precedes the stream start as a "negative"
/// value: low nibble of the first byte all ones, the remaining bytes holding
/// the one's complement of a 30-bit magnitude in the usual marker layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeTimestamp {
    Value(u64),
    Negative(u64),
}

impl DecodeTimestamp {
    pub fn decode(field: &[u8; TIMESTAMP_FIELD_LEN]) -> Self {
        if field[0] & NEGATIVE_MARKER == NEGATIVE_MARKER {
            let c = field.map(|b| u64::from(0xFF - b));
            let high = ((c[1] << 8) | c[2]) >> 1;
            let low = ((c[3] << 8) | c[4]) >> 1;
            Self::Negative((high << 15) | low)
        } else {
            Self::Value(decode_timestamp(field))
        }
    }

    pub fn ticks(self) -> i64 {
        match self {
            Self::Value(v) => v as i64,
            Self::Negative(m) => -(m as i64),
        }
    }

    /// Encode `ticks`, using the negative form when it is below zero.
    pub fn encode(ticks: i64) -> [u8; TIMESTAMP_FIELD_LEN] {
        if ticks >= 0 {
            return encode_timestamp(ticks as u64, PREFIX_DTS);
        }
        let magnitude = ticks.unsigned_abs() & NEGATIVE_MAGNITUDE_MASK;
        let high = (((magnitude >> 15) & 0x7FFF) << 1) | 1;
        let low = ((magnitude & 0x7FFF) << 1) | 1;
        [
            (PREFIX_DTS << 4) | NEGATIVE_MARKER,
            0xFF - (high >> 8) as u8,
            0xFF - high as u8,
            0xFF - (low >> 8) as u8,
            0xFF - low as u8,
        ]
    }
}

/// Shift a PTS field in place, keeping its prefix nibble.
pub fn shift_pts(field: &mut [u8; TIMESTAMP_FIELD_LEN], delta: i64) -> u64 {
    let prefix = field[0] >> 4;
    let shifted = shift_timestamp(decode_timestamp(field), delta);
    *field = encode_timestamp(shifted, prefix);
    shifted
}

/// Shift a DTS field in place.
///
/// A negative DTS that becomes non-negative is rewritten as a regular DTS;
/// one that stays negative keeps the negative form.
pub fn shift_dts(field: &mut [u8; TIMESTAMP_FIELD_LEN], delta: i64) -> i64 {
    match DecodeTimestamp::decode(field) {
        DecodeTimestamp::Value(v) => {
            let prefix = field[0] >> 4;
            let shifted = shift_timestamp(v, delta);
            *field = encode_timestamp(shifted, prefix);
            shifted as i64
        }
        negative @ DecodeTimestamp::Negative(_) => {
            let shifted = negative.ticks().saturating_add(delta);
            *field = DecodeTimestamp::encode(shifted);
            shifted
        }
    }
}
