//! Reinterpretation of bytes crossing a pipe.

use bytes::{Bytes, BytesMut};

/// How a pipe forwarder reshapes the bytes it relays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamModifier {
    #[default]
    PassThrough,
    /// Elementary stream framing; only the optional header is added.
    Elementary { header: Option<Bytes> },
    /// Raw PCM from the transcoder, re-emitted as big-endian LPCM.
    Pcm {
        channels: u16,
        sample_rate: u32,
        bits_per_sample: u16,
        header: Option<Bytes>,
    },
    /// Already encoded audio (AC-3, DTS...) passed through.
    EncodedAudio { header: Option<Bytes> },
}

impl StreamModifier {
    pub fn header(&self) -> Option<&Bytes> {
        match self {
            Self::PassThrough => None,
            Self::Elementary { header }
            | Self::Pcm { header, .. }
            | Self::EncodedAudio { header } => header.as_ref(),
        }
    }

    /// Bytes per sample that need swapping, if any.
    fn swap_width(&self) -> Option<usize> {
        match self {
            Self::Pcm {
                bits_per_sample: 16,
                ..
            } => Some(2),
            Self::Pcm {
                bits_per_sample: 24,
                ..
            } => Some(3),
            _ => None,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PassThrough)
    }
}

/// Running state of a modifier over one stream.
#[derive(Debug)]
pub struct ModifierState {
    modifier: StreamModifier,
    header_sent: bool,
    carry: Vec<u8>,
}

impl ModifierState {
    pub fn new(modifier: StreamModifier) -> Self {
        Self {
            modifier,
            header_sent: false,
            carry: Vec::new(),
        }
    }

    pub fn modifier(&self) -> &StreamModifier {
        &self.modifier
    }

    /// Transform one chunk. Partial samples are held back until the next chunk.
    pub fn apply(&mut self, chunk: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(chunk.len() + self.carry.len() + 64);
        if !self.header_sent {
            self.header_sent = true;
            if let Some(header) = self.modifier.header() {
                out.extend_from_slice(header);
            }
        }

        let Some(width) = self.modifier.swap_width() else {
            out.extend_from_slice(chunk);
            return out.freeze();
        };

        self.carry.extend_from_slice(chunk);
        let whole = self.carry.len() - self.carry.len() % width;
        for sample in self.carry[..whole].chunks_exact(width) {
            out.extend(sample.iter().rev());
        }
        self.carry.drain(..whole);
        out.freeze()
    }

    /// Flush at end of stream: emits a pending header and any trailing partial sample as is.
    pub fn finish(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        if !self.header_sent {
            self.header_sent = true;
            if let Some(header) = self.modifier.header() {
                out.extend_from_slice(header);
            }
        }
        out.extend_from_slice(&self.carry);
        self.carry.clear();
        out.freeze()
    }
}
