// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-SSRC status snapshots decoded from the shared status group.
//!
//! Snapshots are updated opportunistically from whatever fields a status
//! datagram carries; consumers judge freshness from `last_update_ms`.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::tlv::{self, tags, TlvError};

/// Wall clock in unix milliseconds, the timebase of `last_update_ms`.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Demodulator kind reported by the back end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DemodType {
    #[default]
    Linear,
    Fm,
    Wfm,
    Spectrum,
    Unknown,
}

impl DemodType {
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => Self::Linear,
            1 => Self::Fm,
            2 => Self::Wfm,
            3 => Self::Spectrum,
            _ => Self::Unknown,
        }
    }
}

/// Frontend (RF hardware) state for one SSRC.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrontendStatus {
    pub lna_gain_db: i32,
    pub mixer_gain_db: i32,
    pub if_gain_db: i32,
    pub rf_atten_db: f32,
    pub rf_gain_db: f32,
    pub rf_agc: bool,
    pub if_power_dbfs: f32,
    pub ad_overranges: u64,
    pub samples_since_overrange: u64,
    pub last_update_ms: u64,
}

impl FrontendStatus {
    /// Apply one status TLV. Returns whether the tag belonged here.
    pub fn apply(&mut self, tag: u8, value: &[u8]) -> Result<bool, TlvError> {
        match tag {
            tags::LNA_GAIN => self.lna_gain_db = tlv::decode_u32(value)? as i32,
            tags::MIXER_GAIN => self.mixer_gain_db = tlv::decode_u32(value)? as i32,
            tags::IF_GAIN => self.if_gain_db = tlv::decode_u32(value)? as i32,
            tags::RF_ATTEN => self.rf_atten_db = tlv::decode_f32(value)?,
            tags::RF_GAIN => self.rf_gain_db = tlv::decode_f32(value)?,
            tags::RF_AGC => self.rf_agc = tlv::decode_u8(value)? != 0,
            tags::IF_POWER => self.if_power_dbfs = tlv::decode_f32(value)?,
            tags::AD_OVERRANGES => self.ad_overranges = tlv::decode_u64(value)?,
            tags::SAMPLES_SINCE_OVERRANGE => {
                self.samples_since_overrange = tlv::decode_u64(value)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_update_ms)
    }
}

/// Demodulated-channel state for one SSRC.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStatus {
    pub frequency_hz: f64,
    pub preset: String,
    pub demod: DemodType,
    pub output_samprate: u32,
    pub low_edge_hz: f32,
    pub high_edge_hz: f32,
    pub baseband_power_dbfs: f32,
    pub noise_density_dbfs: f32,
    pub output_packets: u64,
    pub last_update_ms: u64,
}

impl ChannelStatus {
    /// Apply one status TLV. Returns whether the tag belonged here.
    pub fn apply(&mut self, tag: u8, value: &[u8]) -> Result<bool, TlvError> {
        match tag {
            tags::RADIO_FREQUENCY => self.frequency_hz = tlv::decode_f64(value)?,
            tags::PRESET => self.preset = tlv::decode_str(value)?.to_string(),
            tags::DEMOD_TYPE => self.demod = DemodType::from_wire(tlv::decode_u8(value)?),
            tags::OUTPUT_SAMPRATE => self.output_samprate = tlv::decode_u32(value)?,
            tags::LOW_EDGE => self.low_edge_hz = tlv::decode_f32(value)?,
            tags::HIGH_EDGE => self.high_edge_hz = tlv::decode_f32(value)?,
            tags::BASEBAND_POWER => self.baseband_power_dbfs = tlv::decode_f32(value)?,
            tags::NOISE_DENSITY => self.noise_density_dbfs = tlv::decode_f32(value)?,
            tags::OUTPUT_DATA_PACKETS => self.output_packets = tlv::decode_u64(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_update_ms)
    }
}
