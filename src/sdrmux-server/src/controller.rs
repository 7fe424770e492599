// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Radio-channel controller.
//!
//! Builds command packets for the shared status group and keeps per-SSRC
//! frontend and channel snapshots from the status datagrams flowing back.
//! Sends are serialized under a mutex so concurrent session updates never
//! interleave TLV bytes, and a command either hits the wire within the
//! deadline or fails without retry.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use sdrmux_core::status::{unix_millis, ChannelStatus, FrontendStatus};
use sdrmux_core::tlv::{self, tags, PacketBuilder, PacketType, TlvError, TlvReader};

use crate::error::ControlError;
use crate::metrics::GatewayMetrics;

/// Requested status cadence in output frames; five frames is roughly one
/// update every 100 ms. Re-sent on every update because preset reloads
/// reset it.
const STATUS_INTERVAL_FRAMES: u32 = 5;
const SEND_DEADLINE: Duration = Duration::from_secs(1);

/// Threshold sentinel that holds the squelch permanently open.
pub const SQUELCH_ALWAYS_OPEN: f32 = -999.0;

/// SNR squelch thresholds in dB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Squelch {
    pub open_db: f32,
    pub close_db: f32,
}

impl Squelch {
    pub fn always_open() -> Self {
        Self {
            open_db: SQUELCH_ALWAYS_OPEN,
            close_db: SQUELCH_ALWAYS_OPEN,
        }
    }

    /// Values to put on the wire; the sentinel forces both thresholds.
    fn wire(&self) -> (f32, f32) {
        if self.open_db == SQUELCH_ALWAYS_OPEN {
            (SQUELCH_ALWAYS_OPEN, SQUELCH_ALWAYS_OPEN)
        } else {
            (self.open_db, self.close_db)
        }
    }
}

/// Subset of audio-channel parameters to re-send.
#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub frequency_hz: Option<f64>,
    pub preset: Option<String>,
    pub low_edge_hz: Option<f32>,
    pub high_edge_hz: Option<f32>,
    /// Edges are only re-sent on request; a preset change reloads them.
    pub send_edges: bool,
    pub squelch: Option<Squelch>,
}

fn wall_clock_tag() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn put_squelch(b: &mut PacketBuilder, squelch: Squelch) {
    let (open, close) = squelch.wire();
    b.put_u8(tags::SNR_SQUELCH, 1);
    b.put_f32(tags::SQUELCH_OPEN, open);
    b.put_f32(tags::SQUELCH_CLOSE, close);
}

/// Create-channel command. The frequency must precede the preset, and
/// explicit edges must follow it, because loading a preset resets both.
fn build_create_channel(
    ssrc: u32,
    frequency_hz: f64,
    preset: &str,
    edges: Option<(f32, f32)>,
    squelch: Option<Squelch>,
    command_tag: u64,
) -> Vec<u8> {
    let mut b = PacketBuilder::new(PacketType::Command);
    b.put_u32(tags::OUTPUT_SSRC, ssrc);
    b.put_f64(tags::RADIO_FREQUENCY, frequency_hz);
    b.put_string(tags::PRESET, preset);
    if let Some((low, high)) = edges {
        b.put_f32(tags::LOW_EDGE, low);
        b.put_f32(tags::HIGH_EDGE, high);
    }
    b.put_u32(tags::STATUS_INTERVAL, STATUS_INTERVAL_FRAMES);
    if let Some(squelch) = squelch {
        put_squelch(&mut b, squelch);
    }
    b.put_u64(tags::COMMAND_TAG, command_tag);
    b.finish()
}

fn build_create_spectrum(
    ssrc: u32,
    center_hz: f64,
    bin_count: u32,
    bin_bandwidth_hz: f32,
    command_tag: u64,
) -> Vec<u8> {
    let half_span = bin_count as f32 * bin_bandwidth_hz / 2.0;
    let mut b = PacketBuilder::new(PacketType::Command);
    b.put_u32(tags::OUTPUT_SSRC, ssrc);
    b.put_f64(tags::RADIO_FREQUENCY, center_hz);
    b.put_string(tags::PRESET, "spectrum");
    b.put_f32(tags::LOW_EDGE, -half_span);
    b.put_f32(tags::HIGH_EDGE, half_span);
    b.put_u32(tags::BIN_COUNT, bin_count);
    b.put_f32(tags::NONCOHERENT_BIN_BW, bin_bandwidth_hz);
    b.put_u32(tags::STATUS_INTERVAL, STATUS_INTERVAL_FRAMES);
    b.put_u64(tags::COMMAND_TAG, command_tag);
    b.finish()
}

fn build_update_channel(ssrc: u32, update: &ChannelUpdate, command_tag: u64) -> Vec<u8> {
    let mut b = PacketBuilder::new(PacketType::Command);
    b.put_u32(tags::OUTPUT_SSRC, ssrc);
    if let Some(frequency_hz) = update.frequency_hz {
        b.put_f64(tags::RADIO_FREQUENCY, frequency_hz);
    }
    if let Some(preset) = &update.preset {
        b.put_string(tags::PRESET, preset);
    }
    if update.send_edges {
        if let Some(low) = update.low_edge_hz {
            b.put_f32(tags::LOW_EDGE, low);
        }
        if let Some(high) = update.high_edge_hz {
            b.put_f32(tags::HIGH_EDGE, high);
        }
    }
    if let Some(squelch) = update.squelch {
        put_squelch(&mut b, squelch);
    }
    b.put_u32(tags::STATUS_INTERVAL, STATUS_INTERVAL_FRAMES);
    b.put_u64(tags::COMMAND_TAG, command_tag);
    b.finish()
}

/// Spectrum update. Edges are always re-sent so the span stays
/// `bin_count * bin_bandwidth` when the bin bandwidth moves.
fn build_update_spectrum(
    ssrc: u32,
    center_hz: f64,
    bin_count: u32,
    bin_bandwidth_hz: f32,
    send_bin_count: bool,
    command_tag: u64,
) -> Vec<u8> {
    let half_span = bin_count as f32 * bin_bandwidth_hz / 2.0;
    let mut b = PacketBuilder::new(PacketType::Command);
    b.put_u32(tags::OUTPUT_SSRC, ssrc);
    b.put_f64(tags::RADIO_FREQUENCY, center_hz);
    b.put_f32(tags::LOW_EDGE, -half_span);
    b.put_f32(tags::HIGH_EDGE, half_span);
    if send_bin_count {
        b.put_u32(tags::BIN_COUNT, bin_count);
    }
    b.put_f32(tags::NONCOHERENT_BIN_BW, bin_bandwidth_hz);
    b.put_u32(tags::STATUS_INTERVAL, STATUS_INTERVAL_FRAMES);
    b.put_u64(tags::COMMAND_TAG, command_tag);
    b.finish()
}

/// Zero frequency idles the channel; the back end garbage-collects it.
fn build_disable(ssrc: u32, command_tag: u64) -> Vec<u8> {
    let mut b = PacketBuilder::new(PacketType::Command);
    b.put_u32(tags::OUTPUT_SSRC, ssrc);
    b.put_f64(tags::RADIO_FREQUENCY, 0.0);
    b.put_u64(tags::COMMAND_TAG, command_tag);
    b.finish()
}

fn build_squelch(ssrc: u32, squelch: Squelch, command_tag: u64) -> Vec<u8> {
    let mut b = PacketBuilder::new(PacketType::Command);
    b.put_u32(tags::OUTPUT_SSRC, ssrc);
    put_squelch(&mut b, squelch);
    b.put_u64(tags::COMMAND_TAG, command_tag);
    b.finish()
}

/// Per-SSRC snapshots of the back end's reported state. Read-mostly:
/// readers take the read lock, only the status listener writes.
#[derive(Default)]
struct StatusTable {
    frontend: RwLock<HashMap<u32, FrontendStatus>>,
    channels: RwLock<HashMap<u32, ChannelStatus>>,
}

impl StatusTable {
    /// Fold one status datagram into the snapshots. Fields for tags we do
    /// not track are skipped; a framing error abandons the rest of the
    /// packet but keeps whatever was already applied.
    fn ingest_at(&self, datagram: &[u8], now_ms: u64) -> Result<(), TlvError> {
        let (kind, mut reader) = TlvReader::parse_packet(datagram)?;
        if kind != PacketType::Status {
            // Our own commands come back via multicast loop; not an error.
            return Ok(());
        }
        let mut fields: Vec<(u8, &[u8])> = Vec::with_capacity(32);
        while let Some(field) = reader.next_field()? {
            fields.push(field);
        }
        let mut ssrc = 0u32;
        for (tag, value) in &fields {
            if *tag == tags::OUTPUT_SSRC {
                ssrc = tlv::decode_u32(value)?;
            }
        }
        if ssrc == 0 {
            return Ok(());
        }

        let mut frontend = self
            .frontend
            .read()
            .expect("frontend map poisoned")
            .get(&ssrc)
            .cloned()
            .unwrap_or_default();
        let mut channel = self
            .channels
            .read()
            .expect("channel map poisoned")
            .get(&ssrc)
            .cloned()
            .unwrap_or_default();
        let mut frontend_touched = false;
        let mut channel_touched = false;
        for (tag, value) in &fields {
            frontend_touched |= frontend.apply(*tag, value)?;
            channel_touched |= channel.apply(*tag, value)?;
        }
        if frontend_touched {
            frontend.last_update_ms = now_ms;
            self.frontend
                .write()
                .expect("frontend map poisoned")
                .insert(ssrc, frontend);
        }
        if channel_touched {
            channel.last_update_ms = now_ms;
            self.channels
                .write()
                .expect("channel map poisoned")
                .insert(ssrc, channel);
        }
        Ok(())
    }
}

/// Owns the control socket and the status snapshots.
pub struct RadioController {
    socket: UdpSocket,
    group: SocketAddrV4,
    send_lock: Mutex<()>,
    status: StatusTable,
    metrics: Arc<GatewayMetrics>,
}

impl RadioController {
    pub fn new(socket: UdpSocket, group: SocketAddrV4, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            socket,
            group,
            send_lock: Mutex::new(()),
            status: StatusTable::default(),
            metrics,
        }
    }

    /// Serialize one packet onto the control group. Holds the send lock
    /// for the duration so commands from different sessions never
    /// interleave. Returns once the datagram is written; status
    /// confirmation is not awaited.
    async fn send(&self, packet: &[u8]) -> Result<(), ControlError> {
        let _guard = self.send_lock.lock().await;
        let result = match timeout(SEND_DEADLINE, self.socket.send_to(packet, self.group)).await {
            Err(_) => Err(ControlError::Timeout),
            Ok(Err(e)) => Err(ControlError::Io(e)),
            Ok(Ok(sent)) if sent != packet.len() => Err(ControlError::ShortWrite {
                sent,
                len: packet.len(),
            }),
            Ok(Ok(_)) => Ok(()),
        };
        if let Err(e) = &result {
            self.metrics
                .control_send_errors
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!("control send failed: {}", e);
        }
        result
    }

    pub async fn create_channel(
        &self,
        name: &str,
        frequency_hz: f64,
        preset: &str,
        ssrc: u32,
        edges: Option<(f32, f32)>,
        squelch: Option<Squelch>,
    ) -> Result<(), ControlError> {
        debug!(
            "create channel '{}' ssrc {:#010x} at {} Hz ({})",
            name, ssrc, frequency_hz, preset
        );
        self.send(&build_create_channel(
            ssrc,
            frequency_hz,
            preset,
            edges,
            squelch,
            wall_clock_tag(),
        ))
        .await
    }

    pub async fn create_spectrum_channel(
        &self,
        name: &str,
        center_hz: f64,
        bin_count: u32,
        bin_bandwidth_hz: f32,
        ssrc: u32,
    ) -> Result<(), ControlError> {
        debug!(
            "create spectrum channel '{}' ssrc {:#010x} centered {} Hz, {} bins of {} Hz",
            name, ssrc, center_hz, bin_count, bin_bandwidth_hz
        );
        self.send(&build_create_spectrum(
            ssrc,
            center_hz,
            bin_count,
            bin_bandwidth_hz,
            wall_clock_tag(),
        ))
        .await
    }

    pub async fn update_channel(
        &self,
        ssrc: u32,
        update: &ChannelUpdate,
    ) -> Result<(), ControlError> {
        self.send(&build_update_channel(ssrc, update, wall_clock_tag()))
            .await
    }

    pub async fn update_spectrum_channel(
        &self,
        ssrc: u32,
        center_hz: f64,
        bin_count: u32,
        bin_bandwidth_hz: f32,
        send_bin_count: bool,
    ) -> Result<(), ControlError> {
        self.send(&build_update_spectrum(
            ssrc,
            center_hz,
            bin_count,
            bin_bandwidth_hz,
            send_bin_count,
            wall_clock_tag(),
        ))
        .await
    }

    pub async fn disable_channel(&self, ssrc: u32) -> Result<(), ControlError> {
        debug!("disable channel ssrc {:#010x}", ssrc);
        self.send(&build_disable(ssrc, wall_clock_tag())).await
    }

    pub async fn update_squelch(&self, ssrc: u32, squelch: Squelch) -> Result<(), ControlError> {
        self.send(&build_squelch(ssrc, squelch, wall_clock_tag()))
            .await
    }

    pub fn get_frontend_status(&self, ssrc: u32) -> Option<FrontendStatus> {
        self.status
            .frontend
            .read()
            .expect("frontend map poisoned")
            .get(&ssrc)
            .cloned()
    }

    pub fn get_all_frontend_status(&self) -> HashMap<u32, FrontendStatus> {
        self.status
            .frontend
            .read()
            .expect("frontend map poisoned")
            .clone()
    }

    pub fn get_channel_status(&self, ssrc: u32) -> Option<ChannelStatus> {
        self.status
            .channels
            .read()
            .expect("channel map poisoned")
            .get(&ssrc)
            .cloned()
    }

    pub fn get_all_channel_status(&self) -> HashMap<u32, ChannelStatus> {
        self.status
            .channels
            .read()
            .expect("channel map poisoned")
            .clone()
    }

    /// Listener task for the status group. Malformed datagrams are
    /// counted and skipped; missing updates just leave snapshots stale.
    pub async fn run_status_listener(
        self: Arc<Self>,
        socket: UdpSocket,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _from)) => {
                            if let Err(e) = self.status.ingest_at(&buf[..len], unix_millis()) {
                                self.metrics
                                    .malformed_status
                                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                debug!("malformed status datagram: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!("status socket read failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        debug!("status listener stopped");
    }
}
