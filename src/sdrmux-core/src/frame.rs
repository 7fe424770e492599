// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Client-facing binary framing for demodulated PCM.
//!
//! Every frame carries one of two headers. The full header describes the
//! stream format; the minimal header only carries the RTP timestamp. A
//! client can decode any frame in isolation once it has seen one full
//! header, so the encoder emits a full header first and again whenever the
//! sample rate or channel count changes. With compression enabled each
//! header+payload block is deflated as an independent unit, preserving
//! that property.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Full header magic, "PC".
pub const MAGIC_FULL: u16 = 0x5043;
/// Minimal header magic, "PM".
pub const MAGIC_MINIMAL: u16 = 0x504D;
pub const FRAME_VERSION: u8 = 1;
pub const FULL_HEADER_LEN: usize = 29;
pub const MINIMAL_HEADER_LEN: usize = 13;

/// Stream format byte carried in the full header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFormat {
    RawPcm = 0,
    Opus = 1,
    CompressedPcm = 2,
}

/// One demodulated PCM frame about to leave the session's delivery queue.
#[derive(Debug, Clone, Copy)]
pub struct PcmFrame<'a> {
    pub rtp_timestamp: u64,
    pub sample_rate: u32,
    pub channels: u8,
    pub samples: &'a [i16],
}

/// Stateful per-session encoder.
pub struct AudioFramer {
    compress: bool,
    last_format: Option<(u32, u8)>,
}

impl AudioFramer {
    pub fn new(compress: bool) -> Self {
        Self {
            compress,
            last_format: None,
        }
    }

    fn format(&self) -> FrameFormat {
        if self.compress {
            FrameFormat::CompressedPcm
        } else {
            FrameFormat::RawPcm
        }
    }

    /// Force a full header on the next frame, e.g. after a client
    /// reconnects mid-stream.
    pub fn reset(&mut self) {
        self.last_format = None;
    }

    pub fn encode(&mut self, frame: &PcmFrame<'_>) -> io::Result<Bytes> {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.encode_at(frame, wall_ms)
    }

    pub fn encode_at(&mut self, frame: &PcmFrame<'_>, wall_ms: u64) -> io::Result<Bytes> {
        let fmt = (frame.sample_rate, frame.channels);
        let full = self.last_format != Some(fmt);
        self.last_format = Some(fmt);

        let mut block =
            Vec::with_capacity(FULL_HEADER_LEN + frame.samples.len() * 2);
        if full {
            block.extend_from_slice(&MAGIC_FULL.to_be_bytes());
            block.push(FRAME_VERSION);
            block.push(self.format() as u8);
            block.extend_from_slice(&frame.rtp_timestamp.to_be_bytes());
            block.extend_from_slice(&wall_ms.to_be_bytes());
            block.extend_from_slice(&frame.sample_rate.to_be_bytes());
            block.push(frame.channels);
            block.extend_from_slice(&0u32.to_be_bytes());
            debug_assert_eq!(block.len(), FULL_HEADER_LEN);
        } else {
            block.extend_from_slice(&MAGIC_MINIMAL.to_be_bytes());
            block.push(FRAME_VERSION);
            block.extend_from_slice(&frame.rtp_timestamp.to_be_bytes());
            block.extend_from_slice(&0u16.to_be_bytes());
            debug_assert_eq!(block.len(), MINIMAL_HEADER_LEN);
        }
        for s in frame.samples {
            block.extend_from_slice(&s.to_be_bytes());
        }

        if self.compress {
            let mut enc =
                ZlibEncoder::new(Vec::with_capacity(block.len() / 2), Compression::fast());
            enc.write_all(&block)?;
            block = enc.finish()?;
        }
        Ok(Bytes::from(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn frame(ts: u64, rate: u32, channels: u8) -> PcmFrame<'static> {
        PcmFrame {
            rtp_timestamp: ts,
            sample_rate: rate,
            channels,
            samples: &[0x0102, -2],
        }
    }

    #[test]
    fn test_first_frame_gets_full_header() {
        let mut framer = AudioFramer::new(false);
        let out = framer.encode_at(&frame(7, 12_000, 1), 1_000).unwrap();
        assert_eq!(out.len(), FULL_HEADER_LEN + 4);
        assert_eq!(&out[..2], &MAGIC_FULL.to_be_bytes());
        assert_eq!(out[2], FRAME_VERSION);
        assert_eq!(out[3], FrameFormat::RawPcm as u8);
        assert_eq!(&out[4..12], &7u64.to_be_bytes());
        assert_eq!(&out[12..20], &1_000u64.to_be_bytes());
        assert_eq!(&out[20..24], &12_000u32.to_be_bytes());
        assert_eq!(out[24], 1);
        // Payload is big-endian PCM.
        assert_eq!(&out[FULL_HEADER_LEN..], &[0x01, 0x02, 0xFF, 0xFE]);
    }

    #[test]
    fn test_steady_state_uses_minimal_header() {
        let mut framer = AudioFramer::new(false);
        framer.encode_at(&frame(1, 12_000, 1), 0).unwrap();
        let out = framer.encode_at(&frame(2, 12_000, 1), 0).unwrap();
        assert_eq!(out.len(), MINIMAL_HEADER_LEN + 4);
        assert_eq!(&out[..2], &MAGIC_MINIMAL.to_be_bytes());
        assert_eq!(&out[3..11], &2u64.to_be_bytes());
    }

    #[test]
    fn test_format_change_re_emits_full_header() {
        let mut framer = AudioFramer::new(false);
        framer.encode_at(&frame(1, 12_000, 1), 0).unwrap();
        framer.encode_at(&frame(2, 12_000, 1), 0).unwrap();
        let out = framer.encode_at(&frame(3, 24_000, 1), 0).unwrap();
        assert_eq!(&out[..2], &MAGIC_FULL.to_be_bytes());
        let out = framer.encode_at(&frame(4, 24_000, 2), 0).unwrap();
        assert_eq!(&out[..2], &MAGIC_FULL.to_be_bytes());
        let out = framer.encode_at(&frame(5, 24_000, 2), 0).unwrap();
        assert_eq!(&out[..2], &MAGIC_MINIMAL.to_be_bytes());
    }

    #[test]
    fn test_reset_forces_full_header() {
        let mut framer = AudioFramer::new(false);
        framer.encode_at(&frame(1, 12_000, 1), 0).unwrap();
        framer.reset();
        let out = framer.encode_at(&frame(2, 12_000, 1), 0).unwrap();
        assert_eq!(&out[..2], &MAGIC_FULL.to_be_bytes());
    }

    #[test]
    fn test_compressed_blocks_decode_in_isolation() {
        let mut framer = AudioFramer::new(true);
        framer.encode_at(&frame(1, 12_000, 1), 0).unwrap();
        let block = framer.encode_at(&frame(2, 12_000, 1), 0).unwrap();

        let mut plain = Vec::new();
        ZlibDecoder::new(&block[..]).read_to_end(&mut plain).unwrap();
        assert_eq!(&plain[..2], &MAGIC_MINIMAL.to_be_bytes());
        assert_eq!(plain.len(), MINIMAL_HEADER_LEN + 4);
    }

    #[test]
    fn test_compressed_full_header_marks_format() {
        let mut framer = AudioFramer::new(true);
        let block = framer.encode_at(&frame(1, 12_000, 1), 0).unwrap();
        let mut plain = Vec::new();
        ZlibDecoder::new(&block[..]).read_to_end(&mut plain).unwrap();
        assert_eq!(plain[3], FrameFormat::CompressedPcm as u8);
    }
}
