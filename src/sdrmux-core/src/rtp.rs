// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! RTP fixed-header parsing for the data multicast group.
//!
//! Only the fields the receiver demultiplexes on are surfaced; CSRC lists
//! and header extensions are skipped so `payload_offset` points at the
//! demodulated samples or spectrum bins.

use thiserror::Error;

pub const RTP_VERSION: u8 = 2;
const FIXED_HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpError {
    #[error("datagram of {0} bytes is shorter than an RTP header")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
}

/// Parsed RTP fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Offset of the payload within the datagram, past CSRCs and any
    /// header extension.
    pub payload_offset: usize,
    /// Trailing padding bytes to strip from the payload, per the P bit.
    pub padding: usize,
}

impl RtpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, RtpError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(RtpError::TooShort(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let has_padding = buf[0] & 0x20 != 0;
        let has_extension = buf[0] & 0x10 != 0;
        let csrc_count = usize::from(buf[0] & 0x0f);
        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7f;
        let sequence = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut offset = FIXED_HEADER_LEN + csrc_count * 4;
        if buf.len() < offset {
            return Err(RtpError::TooShort(buf.len()));
        }
        if has_extension {
            if buf.len() < offset + 4 {
                return Err(RtpError::TooShort(buf.len()));
            }
            let ext_words = usize::from(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
            offset += 4 + ext_words * 4;
            if buf.len() < offset {
                return Err(RtpError::TooShort(buf.len()));
            }
        }
        let padding = if has_padding {
            usize::from(*buf.last().unwrap_or(&0))
        } else {
            0
        };

        Ok(Self {
            version,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload_offset: offset,
            padding,
        })
    }

    /// Payload slice of the datagram this header was parsed from.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let end = buf.len().saturating_sub(self.padding).max(self.payload_offset);
        &buf[self.payload_offset..end]
    }
}

/// Decode a big-endian signed 16-bit PCM payload.
pub fn pcm_samples(payload: &[u8]) -> Vec<i16> {
    payload
        .chunks_exact(2)
        .map(|c| i16::from_be_bytes([c[0], c[1]]))
        .collect()
}

/// Decode a packed native-IEEE-754 32-bit float spectrum payload (dBFS bins).
pub fn spectrum_bins(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
