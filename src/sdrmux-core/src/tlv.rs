// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Tag-length-value control dialect shared with the radio back end.
//!
//! A packet is one leading type byte (`0` = status, `1` = command), zero or
//! more `[tag][length][bytes…]` fields, and a terminating zero tag. Integer
//! and float content is big-endian with leading zero bytes suppressed, so
//! length 0 encodes the value 0. Strings longer than 127 bytes use an
//! extended length prefix (`0x80 | n` followed by `n` big-endian length
//! bytes).

use thiserror::Error;

/// Tag space shared with the radio back end.
///
/// Only the tags the multiplexer emits or consumes are listed; the back end
/// defines more, which decoders must skip.
pub mod tags {
    /// Packet terminator.
    pub const EOL: u8 = 0x00;
    /// Command serial, echoed in status packets.
    pub const COMMAND_TAG: u8 = 0x01;
    /// SSRC of the RTP stream the command addresses.
    pub const OUTPUT_SSRC: u8 = 0x12;

    // Frontend metrics, reported in status packets only.
    pub const LNA_GAIN: u8 = 30;
    pub const MIXER_GAIN: u8 = 31;
    pub const IF_GAIN: u8 = 32;
    pub const IF_POWER: u8 = 47;
    pub const RF_ATTEN: u8 = 96;
    pub const RF_GAIN: u8 = 97;
    pub const RF_AGC: u8 = 98;
    pub const AD_OVERRANGES: u8 = 103;
    pub const SAMPLES_SINCE_OVERRANGE: u8 = 107;

    /// Tuned frequency, double, Hz.
    pub const RADIO_FREQUENCY: u8 = 0x21;
    /// Demodulator kind, byte.
    pub const DEMOD_TYPE: u8 = 0x2A;
    /// Output sample rate, 32-bit int, Hz.
    pub const OUTPUT_SAMPRATE: u8 = 0x2B;
    /// Filter edges, float, Hz.
    pub const LOW_EDGE: u8 = 0x27;
    pub const HIGH_EDGE: u8 = 0x28;
    /// Baseband power and N0, float, dBFS.
    pub const BASEBAND_POWER: u8 = 0x31;
    pub const NOISE_DENSITY: u8 = 0x32;
    /// Cumulative RTP packets emitted for the channel, 64-bit int.
    pub const OUTPUT_DATA_PACKETS: u8 = 0x44;
    /// Squelch thresholds, float, dB SNR.
    pub const SQUELCH_OPEN: u8 = 0x53;
    pub const SQUELCH_CLOSE: u8 = 0x54;
    /// Preset name, string.
    pub const PRESET: u8 = 0x55;
    /// SNR squelch enable, byte.
    pub const SNR_SQUELCH: u8 = 0x5C;
    /// Spectrum bin parameters.
    pub const NONCOHERENT_BIN_BW: u8 = 0x5D;
    pub const BIN_COUNT: u8 = 0x5E;
    /// Status update cadence in output frames.
    pub const STATUS_INTERVAL: u8 = 0x6A;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("packet truncated before terminator")]
    Truncated,
    #[error("unknown packet type byte {0:#04x}")]
    BadPacketType(u8),
    #[error("tag {tag:#04x} has unsupported length prefix")]
    BadLengthPrefix { tag: u8 },
    #[error("value of {0} bytes does not fit a {1}-byte field")]
    Overlong(usize, usize),
    #[error("string value is not valid UTF-8")]
    BadUtf8,
}

/// Leading packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Status = 0,
    Command = 1,
}

/// Builds one control packet by appending TLV fields to a byte buffer.
///
/// Field order is significant to the back end (a preset reloads the fields
/// it covers), so callers emit fields in the order the dialect requires and
/// `finish` seals the packet with the zero tag.
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(kind: PacketType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(kind as u8);
        Self { buf }
    }

    /// Append the common big-endian integer encoding: leading zero bytes
    /// are suppressed and length 0 encodes the value 0.
    fn put_uint(&mut self, tag: u8, width: usize, v: u64) -> &mut Self {
        let bytes = v.to_be_bytes();
        let sig = &bytes[bytes.len() - width..];
        let skip = sig.iter().take_while(|b| **b == 0).count();
        let out = &sig[skip..];
        self.buf.push(tag);
        self.buf.push(out.len() as u8);
        self.buf.extend_from_slice(out);
        self
    }

    pub fn put_u8(&mut self, tag: u8, v: u8) -> &mut Self {
        self.put_uint(tag, 1, u64::from(v))
    }

    pub fn put_u32(&mut self, tag: u8, v: u32) -> &mut Self {
        self.put_uint(tag, 4, u64::from(v))
    }

    pub fn put_u64(&mut self, tag: u8, v: u64) -> &mut Self {
        self.put_uint(tag, 8, v)
    }

    pub fn put_f32(&mut self, tag: u8, v: f32) -> &mut Self {
        self.put_uint(tag, 4, u64::from(v.to_bits()))
    }

    pub fn put_f64(&mut self, tag: u8, v: f64) -> &mut Self {
        self.put_uint(tag, 8, v.to_bits())
    }

    /// Append a string field. Strings up to 127 bytes use the one-byte
    /// length; longer strings get the two-byte extended length prefix.
    pub fn put_string(&mut self, tag: u8, s: &str) -> &mut Self {
        let b = s.as_bytes();
        debug_assert!(b.len() <= usize::from(u16::MAX));
        self.buf.push(tag);
        if b.len() <= 127 {
            self.buf.push(b.len() as u8);
        } else {
            self.buf.push(0x82);
            self.buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
        }
        self.buf.extend_from_slice(b);
        self
    }

    /// Seal the packet with the zero tag and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(tags::EOL);
        self.buf
    }
}

/// Iterates the TLV fields of one packet body.
#[derive(Debug)]
pub struct TlvReader<'a> {
    rest: &'a [u8],
}

impl<'a> TlvReader<'a> {
    /// Read a whole datagram: type byte, then the field stream.
    pub fn parse_packet(buf: &'a [u8]) -> Result<(PacketType, Self), TlvError> {
        let (&first, rest) = buf.split_first().ok_or(TlvError::Truncated)?;
        let kind = match first {
            0 => PacketType::Status,
            1 => PacketType::Command,
            other => return Err(TlvError::BadPacketType(other)),
        };
        Ok((kind, Self { rest }))
    }

    /// Next `(tag, value)` field, or `None` at the zero terminator.
    ///
    /// Callers skip tags they do not understand; the reader only cares
    /// about framing.
    pub fn next_field(&mut self) -> Result<Option<(u8, &'a [u8])>, TlvError> {
        let (&tag, rest) = self.rest.split_first().ok_or(TlvError::Truncated)?;
        if tag == tags::EOL {
            self.rest = rest;
            return Ok(None);
        }
        let (&len_byte, rest) = rest.split_first().ok_or(TlvError::Truncated)?;
        let (len, rest) = if len_byte & 0x80 == 0 {
            (usize::from(len_byte), rest)
        } else {
            let n = usize::from(len_byte & 0x7f);
            if n == 0 || n > 4 {
                return Err(TlvError::BadLengthPrefix { tag });
            }
            if rest.len() < n {
                return Err(TlvError::Truncated);
            }
            let len = rest[..n].iter().fold(0usize, |acc, b| acc << 8 | usize::from(*b));
            (len, &rest[n..])
        };
        if rest.len() < len {
            return Err(TlvError::Truncated);
        }
        let (value, rest) = rest.split_at(len);
        self.rest = rest;
        Ok(Some((tag, value)))
    }
}

/// Reassemble a suppressed big-endian integer by left-padding with zeros.
pub fn decode_u64(v: &[u8]) -> Result<u64, TlvError> {
    if v.len() > 8 {
        return Err(TlvError::Overlong(v.len(), 8));
    }
    Ok(v.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b)))
}

pub fn decode_u32(v: &[u8]) -> Result<u32, TlvError> {
    if v.len() > 4 {
        return Err(TlvError::Overlong(v.len(), 4));
    }
    Ok(decode_u64(v)? as u32)
}

pub fn decode_u8(v: &[u8]) -> Result<u8, TlvError> {
    if v.len() > 1 {
        return Err(TlvError::Overlong(v.len(), 1));
    }
    Ok(v.first().copied().unwrap_or(0))
}

/// Length 0 decodes to 0.0, like the integer case.
pub fn decode_f32(v: &[u8]) -> Result<f32, TlvError> {
    Ok(f32::from_bits(decode_u32(v)?))
}

pub fn decode_f64(v: &[u8]) -> Result<f64, TlvError> {
    Ok(f64::from_bits(decode_u64(v)?))
}

pub fn decode_str(v: &[u8]) -> Result<&str, TlvError> {
    std::str::from_utf8(v).map_err(|_| TlvError::BadUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(packet: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let (_, mut reader) = TlvReader::parse_packet(packet).unwrap();
        let mut out = Vec::new();
        while let Some((tag, value)) = reader.next_field().unwrap() {
            out.push((tag, value.to_vec()));
        }
        out
    }

    #[test]
    fn test_zero_suppression() {
        let mut b = PacketBuilder::new(PacketType::Command);
        b.put_u32(tags::BIN_COUNT, 0x12345678);
        b.put_u32(tags::STATUS_INTERVAL, 5);
        b.put_u32(tags::OUTPUT_SAMPRATE, 0);
        let packet = b.finish();
        assert_eq!(
            packet,
            vec![
                0x01, // command
                tags::BIN_COUNT, 4, 0x12, 0x34, 0x56, 0x78,
                tags::STATUS_INTERVAL, 1, 5,
                tags::OUTPUT_SAMPRATE, 0,
                0x00,
            ]
        );
    }

    #[test]
    fn test_u64_round_trip() {
        for v in [0u64, 1, 255, 256, 0xDEAD_BEEF, u64::MAX, 1 << 56] {
            let mut b = PacketBuilder::new(PacketType::Command);
            b.put_u64(tags::AD_OVERRANGES, v);
            let packet = b.finish();
            let f = fields(&packet);
            assert_eq!(decode_u64(&f[0].1).unwrap(), v);
        }
    }

    #[test]
    fn test_f64_round_trip() {
        for v in [0.0f64, 14_074_000.0, -999.0, 29296.875, f64::MAX] {
            let mut b = PacketBuilder::new(PacketType::Command);
            b.put_f64(tags::RADIO_FREQUENCY, v);
            let f = fields(&b.finish());
            assert_eq!(decode_f64(&f[0].1).unwrap(), v);
        }
    }

    #[test]
    fn test_f32_round_trip() {
        for v in [0.0f32, -999.0, 29296.875, 1.5e-3] {
            let mut b = PacketBuilder::new(PacketType::Command);
            b.put_f32(tags::LOW_EDGE, v);
            let f = fields(&b.finish());
            assert_eq!(decode_f32(&f[0].1).unwrap(), v);
        }
    }

    #[test]
    fn test_length_zero_decodes_to_zero() {
        assert_eq!(decode_u32(&[]).unwrap(), 0);
        assert_eq!(decode_u64(&[]).unwrap(), 0);
        assert_eq!(decode_f32(&[]).unwrap(), 0.0);
        assert_eq!(decode_f64(&[]).unwrap(), 0.0);
    }

    #[test]
    fn test_short_string() {
        let mut b = PacketBuilder::new(PacketType::Command);
        b.put_string(tags::PRESET, "usb");
        let packet = b.finish();
        assert_eq!(packet[1..5], [tags::PRESET, 3, b'u', b's']);
        let f = fields(&packet);
        assert_eq!(decode_str(&f[0].1).unwrap(), "usb");
    }

    #[test]
    fn test_extended_length_string() {
        let long = "x".repeat(300);
        let mut b = PacketBuilder::new(PacketType::Status);
        b.put_string(tags::PRESET, &long);
        let packet = b.finish();
        // 0x82 then 300 as big-endian u16
        assert_eq!(packet[2..5], [0x82, 0x01, 0x2C]);
        let f = fields(&packet);
        assert_eq!(decode_str(&f[0].1).unwrap(), long);
    }

    #[test]
    fn test_unknown_tags_are_skippable() {
        let mut b = PacketBuilder::new(PacketType::Status);
        b.put_u32(0x7F, 42);
        b.put_string(tags::PRESET, "am");
        let f = fields(&b.finish());
        assert_eq!(f.len(), 2);
        assert_eq!(f[1].0, tags::PRESET);
    }

    #[test]
    fn test_truncated_packet() {
        let mut b = PacketBuilder::new(PacketType::Command);
        b.put_u32(tags::OUTPUT_SSRC, 0x12345678);
        let mut packet = b.finish();
        packet.pop(); // drop the terminator
        packet.pop(); // and part of the value
        let (_, mut reader) = TlvReader::parse_packet(&packet).unwrap();
        assert_eq!(reader.next_field(), Err(TlvError::Truncated));
    }

    #[test]
    fn test_bad_packet_type() {
        assert_eq!(
            TlvReader::parse_packet(&[9, 0]).unwrap_err(),
            TlvError::BadPacketType(9)
        );
    }

    #[test]
    fn test_overlong_value_rejected() {
        assert!(matches!(
            decode_u32(&[1, 2, 3, 4, 5]),
            Err(TlvError::Overlong(5, 4))
        ));
    }
}
