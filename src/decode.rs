//! Bit-stream decoder for the instrument's block payloads.
//!
//! Blocks are a tag/length/value stream. The `0x18` tag carries sample data:
//! a dense, non-byte-aligned sequence of 13-bit unsigned samples, interleaved
//! across the analog channels in round-robin order. Every other tag is
//! skipped wholesale.

/// Width of one raw sample in bits.
pub const SAMPLE_WIDTH: u32 = 13;
const CHAR_WIDTH: u32 = 8;
/// Bound on accumulator growth between extractions.
const ACC_MASK: u32 = (1 << (SAMPLE_WIDTH + CHAR_WIDTH - 1)) - 1;
const SAMPLE_MASK: u32 = (1 << SAMPLE_WIDTH) - 1;

/// Tag marking a sample-data block. Anything else is metadata/acks and is
/// skipped over.
pub const DATA_TAG: u8 = 0x18;

const FULL_SCALE_VOLTS: f32 = 3.3;

/// One decoded sample, attributed to its round-robin channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedSample {
    pub channel: usize,
    pub raw: u16,
}

impl TaggedSample {
    pub fn volts(&self) -> f32 {
        FULL_SCALE_VOLTS * self.raw as f32 / 4096.0
    }
}

/// Decode state carried across buffers of one logical pass.
///
/// Owned by the caller and reset at the start of every fresh pass; it is
/// never process-global. Between samples `valid_bits` stays in
/// `[0, SAMPLE_WIDTH - 1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeCursor {
    acc: u32,
    valid_bits: u32,
    channel: usize,
}

impl DecodeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round-robin channel the next extracted sample will belong to.
    pub fn channel(&self) -> usize {
        self.channel
    }
}

/// Decode every sample recoverable from `buf`.
///
/// A block whose length byte or payload runs past the end of the buffer
/// terminates the scan; the samples extracted up to that point are returned
/// and no byte past the buffer is ever read.
pub fn decode(buf: &[u8], cursor: &mut DecodeCursor, num_channels: usize) -> Vec<TaggedSample> {
    assert!(num_channels > 0);
    let mut samples = Vec::new();
    let mut pos = 0;
    // Need at least a tag and a length byte.
    while pos + 1 < buf.len() {
        let tag = buf[pos];
        let len = buf[pos + 1] as usize;
        if tag == DATA_TAG {
            // A length byte of `n` announces n+1 data bytes.
            let start = pos + 2;
            let end = start + len + 1;
            for &byte in &buf[start..end.min(buf.len())] {
                cursor.acc = ((cursor.acc << CHAR_WIDTH) | byte as u32) & ACC_MASK;
                cursor.valid_bits += CHAR_WIDTH;
                if cursor.valid_bits >= SAMPLE_WIDTH {
                    cursor.valid_bits -= SAMPLE_WIDTH;
                    let raw = ((cursor.acc >> cursor.valid_bits) & SAMPLE_MASK) as u16;
                    samples.push(TaggedSample {
                        channel: cursor.channel,
                        raw,
                    });
                    cursor.channel = (cursor.channel + 1) % num_channels;
                }
            }
            if end > buf.len() {
                // Truncated data block: return what we have.
                break;
            }
            pos = end;
        } else {
            // Escape path: tag, length byte and `len` payload bytes.
            pos += len + 2;
        }
    }
    samples
}

/// Fan a tagged sample stream out into one voltage buffer per channel index.
pub fn demux(samples: &[TaggedSample], num_channels: usize) -> Vec<Vec<f32>> {
    let mut per_channel = vec![Vec::new(); num_channels];
    for sample in samples {
        per_channel[sample.channel].push(sample.volts());
    }
    per_channel
}
