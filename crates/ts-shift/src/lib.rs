//! MPEG timestamp shifting for buffered program/transport streams.
//!
//! This crate rewrites System Clock References (pack headers) and
//! Presentation/Decoding Time Stamps (PES headers) in place, inside a
//! circular byte buffer, so a transcoder started at a seek offset can emit
//! a stream whose clocks continue from the requested position.
//!
//! The pieces are layered:
//!
//! - [`clock`]: 33-bit 90 kHz clock arithmetic
//! - [`ring`]: non-negative modulo and a wrapping view over the backing array
//! - [`scr`]: 6-byte SCR field codec
//! - [`pes`]: 5-byte PTS/DTS field codec and PES header detection
//! - [`patcher`]: the incremental scan-and-patch pass driven by a ring buffer writer
//!
//! Nothing here returns errors: a byte window that does not match the expected
//! layout is simply left untouched.

pub mod clock;
pub mod patcher;
pub mod pes;
pub mod ring;
pub mod scr;

pub use clock::{CLOCK_HZ, TIMESTAMP_MASK, shift_timestamp, ticks_from_seconds};
pub use patcher::{PatchStats, TimestampPatcher, TimestampShift};
pub use pes::{DecodeTimestamp, PesKind};
pub use ring::{RingSlice, modulo};
