//! Incremental timestamp patching over a ring buffer.
//!
//! The ring buffer calls [`TimestampPatcher::on_write`] after every write,
//! while still holding its lock, with the absolute range that was just
//! written. Two independent passes run:
//!
//! - an SCR scan that checks every newly written byte as the possible last
//!   byte of a `00 00 01 BA` + SCR window;
//! - a packet walk that follows TS packets (sync byte 0x47, 188 bytes),
//!   pack headers and PES packets by their declared lengths, patching the
//!   PTS/DTS of every video or audio PES header it lands on.
//!
//! The walk does not know the container up front: TS and PS packets are
//! recognised per packet, so a stream that switches container mid-way is
//! walked with whatever interpretation matches at each position.
//!
//! [`TimestampPatcher::settled`] reports how far the buffer can expose bytes
//! to readers without any later write patching them again.

use tracing::{trace, warn};

use crate::clock::ticks_from_seconds;
use crate::pes::{
    self, AUDIO_HEADER_LEN, DTS_OFFSET, PTS_OFFSET, PesKind, TIMESTAMP_FIELD_LEN,
    VIDEO_HEADER_LEN,
};
use crate::ring::RingSlice;
use crate::scr::{self, PACK_START_CODE, SCR_FIELD_LEN, SCR_WINDOW_LEN};

/// MPEG transport stream sync byte.
pub const TS_SYNC_BYTE: u8 = 0x47;
/// Transport stream packet size.
pub const TS_PACKET_SIZE: usize = 188;
/// Pack header length without stuffing.
pub const PACK_HEADER_LEN: usize = 14;

const PES_LENGTH_PREFIX: usize = 6;
const PES_CLASSIFY_LEN: usize = PTS_OFFSET + 1;

/// Which timestamps get shifted, and by how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampShift {
    ticks: i64,
    patch_scr: bool,
    patch_pes: bool,
}

impl TimestampShift {
    pub fn new(ticks: i64, patch_scr: bool, patch_pes: bool) -> Self {
        Self {
            ticks,
            patch_scr,
            patch_pes,
        }
    }

    /// Derive the shift for a transcode started at `time_seek` seconds.
    ///
    /// SCR patching needs `shift_scr`; PTS/DTS patching only applies to
    /// open-ended transcodes (`time_end == 0`). Returns `None` when nothing
    /// would be patched.
    pub fn from_seek(time_seek: f64, time_end: f64, shift_scr: bool) -> Option<Self> {
        if time_seek.is_nan() || time_seek <= 0.0 {
            return None;
        }
        let patch_scr = shift_scr;
        let patch_pes = time_end == 0.0;
        if !patch_scr && !patch_pes {
            return None;
        }
        Some(Self::new(ticks_from_seconds(time_seek), patch_scr, patch_pes))
    }

    pub fn ticks(&self) -> i64 {
        self.ticks
    }

    pub fn patches_scr(&self) -> bool {
        self.patch_scr
    }

    pub fn patches_pes(&self) -> bool {
        self.patch_pes
    }
}

/// Counters for what the patcher touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub scr_fields: u64,
    pub pts_fields: u64,
    pub dts_fields: u64,
    pub packets: u64,
}

#[derive(Debug)]
pub struct TimestampPatcher {
    shift: TimestampShift,
    /// Bytes before this offset are never examined
    start: u64,
    packet_pos: u64,
    stats: PatchStats,
}

impl TimestampPatcher {
    pub fn new(shift: TimestampShift) -> Self {
        Self::starting_at(shift, 0)
    }

    /// A patcher that leaves the first `offset` bytes alone, for streams
    /// prefixed with a header that is not part of the multiplex.
    pub fn starting_at(shift: TimestampShift, offset: u64) -> Self {
        Self {
            shift,
            start: offset,
            packet_pos: offset,
            stats: PatchStats::default(),
        }
    }

    pub fn shift(&self) -> TimestampShift {
        self.shift
    }

    pub fn stats(&self) -> PatchStats {
        self.stats
    }

    /// Absolute offset of the next packet the walk will look at.
    pub fn packet_pos(&self) -> u64 {
        self.packet_pos
    }

    /// Patch everything that became decidable after `write_start..write_end` was written.
    pub fn on_write(&mut self, ring: &mut RingSlice<'_>, write_start: u64, write_end: u64) {
        if self.shift.patch_scr {
            self.scan_scr(ring, write_start, write_end);
        }
        if self.shift.patch_pes {
            self.walk_packets(ring, write_end, false);
        }
    }

    /// Final pass at end of stream: patch a trailing header even if the
    /// stream ended before the usual look-ahead was available.
    pub fn finish(&mut self, ring: &mut RingSlice<'_>, write_end: u64) {
        if self.shift.patch_pes {
            self.walk_packets(ring, write_end, true);
        }
    }

    /// Exclusive upper bound of the bytes no later write can modify.
    pub fn settled(&self, write_end: u64, eof: bool) -> u64 {
        if eof {
            return write_end;
        }
        let mut visible = write_end;
        if self.shift.patch_scr {
            visible = visible.saturating_sub(SCR_FIELD_LEN as u64 - 1);
        }
        if self.shift.patch_pes {
            visible = visible.min(self.packet_pos);
        }
        visible
    }

    fn scan_scr(&mut self, ring: &mut RingSlice<'_>, write_start: u64, write_end: u64) {
        let first = write_start.max(self.start + SCR_WINDOW_LEN as u64 - 1);
        for end in first..write_end {
            let start = end as i64 - (SCR_WINDOW_LEN as i64 - 1);
            // cheap reject before reading the whole window
            if ring.get(start + 3) != Some(PACK_START_CODE[3]) {
                continue;
            }
            if ring.read_array::<4>(start) != Some(PACK_START_CODE) {
                continue;
            }
            let field_start = start + PACK_START_CODE.len() as i64;
            let Some(mut field) = ring.read_array::<SCR_FIELD_LEN>(field_start) else {
                continue;
            };
            if let Some(value) = scr::shift_scr(&mut field, self.shift.ticks) {
                ring.write_slice(field_start, &field);
                self.stats.scr_fields += 1;
                trace!(offset = start, scr = value, "Shifted SCR");
            }
        }
    }

    fn walk_packets(&mut self, ring: &mut RingSlice<'_>, write_end: u64, final_pass: bool) {
        let modulus = ring.modulus() as u64;
        loop {
            let available = write_end.saturating_sub(self.packet_pos);
            if available > modulus {
                warn!(
                    packet_pos = self.packet_pos,
                    write_end, "Packet walk fell behind the ring, resynchronising"
                );
                self.packet_pos = write_end;
                return;
            }
            if available < PES_LENGTH_PREFIX as u64 {
                return;
            }
            let pos = self.packet_pos as i64;
            let Some(head) = ring.read_array::<PES_LENGTH_PREFIX>(pos) else {
                return;
            };

            let (length, stream_pos) = if head[0] == TS_SYNC_BYTE {
                let mut stream_pos = 4;
                if head[3] & 0x20 != 0 {
                    stream_pos += 1 + head[4] as usize;
                }
                let payload = (stream_pos < TS_PACKET_SIZE).then_some(stream_pos);
                (TS_PACKET_SIZE, payload)
            } else if head[3] == PACK_START_CODE[3] {
                if available < PACK_HEADER_LEN as u64 {
                    return;
                }
                let Some(stuffing) = ring.get(pos + PACK_HEADER_LEN as i64 - 1) else {
                    return;
                };
                (PACK_HEADER_LEN + (stuffing & 0x07) as usize, None)
            } else {
                let declared = u16::from_be_bytes([head[4], head[5]]) as usize;
                (PES_LENGTH_PREFIX + declared, Some(0))
            };

            if let Some(stream_pos) = stream_pos {
                let needed = (stream_pos + VIDEO_HEADER_LEN) as u64;
                if available < needed && !final_pass {
                    return;
                }
                let header_available = available.saturating_sub(stream_pos as u64);
                self.patch_pes(ring, pos + stream_pos as i64, header_available);
            }

            self.stats.packets += 1;
            self.packet_pos += length as u64;
        }
    }

    fn patch_pes(&mut self, ring: &mut RingSlice<'_>, start: i64, available: u64) {
        if available < PES_CLASSIFY_LEN as u64 {
            return;
        }
        let Some(header) = ring.read_array::<PES_CLASSIFY_LEN>(start) else {
            return;
        };
        match pes::classify(&header) {
            Some(PesKind::Video) => {
                if available < AUDIO_HEADER_LEN as u64 {
                    return;
                }
                self.patch_field(ring, start + PTS_OFFSET as i64, false);
                if pes::has_dts(&header) && available >= VIDEO_HEADER_LEN as u64 {
                    self.patch_field(ring, start + DTS_OFFSET as i64, true);
                }
            }
            Some(PesKind::Audio) => {
                if available < AUDIO_HEADER_LEN as u64 {
                    return;
                }
                self.patch_field(ring, start + PTS_OFFSET as i64, false);
            }
            None => {}
        }
    }

    fn patch_field(&mut self, ring: &mut RingSlice<'_>, at: i64, dts: bool) {
        let Some(mut field) = ring.read_array::<TIMESTAMP_FIELD_LEN>(at) else {
            return;
        };
        if dts {
            pes::shift_dts(&mut field, self.shift.ticks);
            self.stats.dts_fields += 1;
        } else {
            pes::shift_pts(&mut field, self.shift.ticks);
            self.stats.pts_fields += 1;
        }
        ring.write_slice(at, &field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pes::{PREFIX_DTS, PREFIX_PTS, decode_timestamp, encode_timestamp};

    fn shift(seconds: i64, scr: bool, pes: bool) -> TimestampShift {
        TimestampShift::new(seconds * 90_000, scr, pes)
    }

    #[test]
    fn test_from_seek_activation() {
        assert_eq!(TimestampShift::from_seek(0.0, 0.0, true), None);
        let both = TimestampShift::from_seek(5.0, 0.0, true).unwrap();
        assert!(both.patches_scr() && both.patches_pes());
        assert_eq!(both.ticks(), 450_000);
        let scr_only = TimestampShift::from_seek(5.0, 30.0, true).unwrap();
        assert!(scr_only.patches_scr() && !scr_only.patches_pes());
        assert_eq!(TimestampShift::from_seek(5.0, 30.0, false), None);
    }

    #[test]
    fn test_scr_split_across_writes() {
        let mut stream = vec![0xAA; 3];
        stream.extend_from_slice(&PACK_START_CODE);
        stream.extend_from_slice(&[0x44, 0x00, 0xDD, 0xDD, 0x04, 0x01]);
        stream.extend_from_slice(&[0xAA; 3]);

        let mut data = vec![0u8; 64];
        let mut patcher = TimestampPatcher::new(shift(5, true, false));
        // first write ends in the middle of the SCR field
        data[..8].copy_from_slice(&stream[..8]);
        let mut ring = RingSlice::new(&mut data, 64).unwrap();
        patcher.on_write(&mut ring, 0, 8);
        assert_eq!(patcher.stats().scr_fields, 0);
        assert_eq!(patcher.settled(8, false), 3);

        ring.write_slice(8, &stream[8..]);
        patcher.on_write(&mut ring, 8, stream.len() as u64);
        assert_eq!(patcher.stats().scr_fields, 1);
        assert_eq!(&data[7..13], &[0x44, 0x01, 0x4C, 0xCB, 0x84, 0x01]);
    }

    #[test]
    fn test_pes_video_pts_and_dts() {
        let mut packet = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x0D, 0x80, 0xC0, 0x0A];
        packet.extend_from_slice(&encode_timestamp(180_000, 0x3));
        packet.extend_from_slice(&encode_timestamp(177_000, PREFIX_DTS));
        assert_eq!(packet.len(), 19);

        let mut data = vec![0u8; 64];
        data[..19].copy_from_slice(&packet);
        let mut ring = RingSlice::new(&mut data, 64).unwrap();
        let mut patcher = TimestampPatcher::new(shift(2, false, true));
        patcher.on_write(&mut ring, 0, 19);

        let stats = patcher.stats();
        assert_eq!((stats.pts_fields, stats.dts_fields), (1, 1));
        let pts: [u8; 5] = data[9..14].try_into().unwrap();
        let dts: [u8; 5] = data[14..19].try_into().unwrap();
        assert_eq!(decode_timestamp(&pts), 360_000);
        assert_eq!(pts[0] >> 4, 0x3);
        assert_eq!(decode_timestamp(&dts), 357_000);
        assert_eq!(patcher.packet_pos(), 19);
    }

    #[test]
    fn test_pes_header_waits_for_look_ahead() {
        let mut packet = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x08, 0x80, 0x80, 0x05];
        packet.extend_from_slice(&encode_timestamp(90_000, PREFIX_PTS));

        let mut data = vec![0u8; 32];
        data[..14].copy_from_slice(&packet);
        let mut ring = RingSlice::new(&mut data, 32).unwrap();
        let mut patcher = TimestampPatcher::new(shift(1, false, true));
        patcher.on_write(&mut ring, 0, 14);
        assert_eq!(patcher.stats().pts_fields, 0);
        assert_eq!(patcher.settled(14, false), 0);

        patcher.finish(&mut ring, 14);
        assert_eq!(patcher.stats().pts_fields, 1);
        assert_eq!(patcher.settled(14, true), 14);
        let pts: [u8; 5] = data[9..14].try_into().unwrap();
        assert_eq!(decode_timestamp(&pts), 180_000);
    }

    #[test]
    fn test_ts_packet_with_adaptation_field() {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[..4].copy_from_slice(&[0x47, 0x41, 0x00, 0x30]);
        packet[4] = 7; // adaptation field length
        let start = 4 + 1 + 7;
        packet[start..start + 9]
            .copy_from_slice(&[0x00, 0x00, 0x01, 0xC0, 0x00, 0x00, 0x80, 0x80, 0x05]);
        packet[start + 9..start + 14].copy_from_slice(&encode_timestamp(90_000, PREFIX_PTS));

        let mut data = vec![0u8; 512];
        data[..TS_PACKET_SIZE].copy_from_slice(&packet);
        let mut ring = RingSlice::new(&mut data, 512).unwrap();
        let mut patcher = TimestampPatcher::new(shift(3, false, true));
        patcher.on_write(&mut ring, 0, TS_PACKET_SIZE as u64);

        assert_eq!(patcher.stats().pts_fields, 1);
        assert_eq!(patcher.packet_pos(), TS_PACKET_SIZE as u64);
        let pts: [u8; 5] = data[start + 9..start + 14].try_into().unwrap();
        assert_eq!(decode_timestamp(&pts), 360_000);
    }

    #[test]
    fn test_pack_header_skipped_with_stuffing() {
        let mut stream = vec![0x00, 0x00, 0x01, 0xBA, 0x44, 0x00, 0x04, 0x00, 0x04, 0x01];
        stream.extend_from_slice(&[0x01, 0x89, 0xC3, 0xFA]); // stuffing length 2
        stream.extend_from_slice(&[0xFF, 0xFF]);
        stream.extend_from_slice(&[0x00, 0x00, 0x01, 0xC0, 0x00, 0x08, 0x80, 0x80, 0x05]);
        stream.extend_from_slice(&encode_timestamp(0, PREFIX_PTS));
        stream.extend_from_slice(&[0x00; 8]);

        let mut data = vec![0u8; 128];
        data[..stream.len()].copy_from_slice(&stream);
        let mut ring = RingSlice::new(&mut data, 128).unwrap();
        let mut patcher = TimestampPatcher::new(shift(1, false, true));
        patcher.on_write(&mut ring, 0, stream.len() as u64);

        assert_eq!(patcher.stats().pts_fields, 1);
        let pts: [u8; 5] = data[25..30].try_into().unwrap();
        assert_eq!(decode_timestamp(&pts), 90_000);
    }

    #[test]
    fn test_bytes_before_start_are_skipped() {
        // looks like a pack header, but belongs to the prefix
        let mut stream = PACK_START_CODE.to_vec();
        stream.extend_from_slice(&[0x44, 0x00, 0xDD, 0xDD, 0x04, 0x01]);
        let prefix = stream.len();
        stream.extend_from_slice(&[0x00, 0x00, 0x01, 0xC0, 0x00, 0x08, 0x80, 0x80, 0x05]);
        stream.extend_from_slice(&encode_timestamp(90_000, PREFIX_PTS));
        stream.extend_from_slice(&[0x00; 8]);

        let mut data = vec![0u8; 64];
        data[..stream.len()].copy_from_slice(&stream);
        let mut ring = RingSlice::new(&mut data, 64).unwrap();
        let mut patcher = TimestampPatcher::starting_at(shift(1, true, true), prefix as u64);
        patcher.on_write(&mut ring, 0, stream.len() as u64);

        assert_eq!(&data[..prefix], &stream[..prefix]);
        let stats = patcher.stats();
        assert_eq!((stats.scr_fields, stats.pts_fields), (0, 1));
        let pts: [u8; 5] = data[prefix + 9..prefix + 14].try_into().unwrap();
        assert_eq!(decode_timestamp(&pts), 180_000);
    }

    #[test]
    fn test_garbage_is_left_alone() {
        let stream: Vec<u8> = (0..200u32).map(|i| (i * 7 + 3) as u8 | 0x10).collect();
        let mut data = stream.clone();
        let mut ring = RingSlice::new(&mut data, 200).unwrap();
        let mut patcher = TimestampPatcher::new(shift(10, true, false));
        patcher.on_write(&mut ring, 0, 200);
        assert_eq!(data, stream);
    }
}
