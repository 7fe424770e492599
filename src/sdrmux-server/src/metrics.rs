// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Process-wide counters.
//!
//! Every condition the pipeline drops silently is counted here so
//! operators can see it; exporters snapshot the lot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Status datagrams that failed TLV parsing.
    pub malformed_status: AtomicU64,
    /// Data datagrams that failed RTP parsing.
    pub malformed_rtp: AtomicU64,
    /// RTP for an SSRC no session owns.
    pub unknown_ssrc: AtomicU64,
    /// Packets older than the reorder window.
    pub stale_packets: AtomicU64,
    /// Duplicate sequence numbers.
    pub duplicate_packets: AtomicU64,
    /// Frames displaced from full delivery queues.
    pub queue_drops: AtomicU64,
    /// Sessions evicted by the janitor, by kind. A pass that evicts both
    /// kinds also counts once as mixed.
    pub kicked_audio: AtomicU64,
    pub kicked_spectrum: AtomicU64,
    pub kicked_mixed: AtomicU64,
    /// Create requests refused by admission policy.
    pub admission_rejected: AtomicU64,
    /// Control commands that failed to reach the socket.
    pub control_send_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub malformed_status: u64,
    pub malformed_rtp: u64,
    pub unknown_ssrc: u64,
    pub stale_packets: u64,
    pub duplicate_packets: u64,
    pub queue_drops: u64,
    pub kicked_audio: u64,
    pub kicked_spectrum: u64,
    pub kicked_mixed: u64,
    pub admission_rejected: u64,
    pub control_send_errors: u64,
}

impl GatewayMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            malformed_status: self.malformed_status.load(Relaxed),
            malformed_rtp: self.malformed_rtp.load(Relaxed),
            unknown_ssrc: self.unknown_ssrc.load(Relaxed),
            stale_packets: self.stale_packets.load(Relaxed),
            duplicate_packets: self.duplicate_packets.load(Relaxed),
            queue_drops: self.queue_drops.load(Relaxed),
            kicked_audio: self.kicked_audio.load(Relaxed),
            kicked_spectrum: self.kicked_spectrum.load(Relaxed),
            kicked_mixed: self.kicked_mixed.load(Relaxed),
            admission_rejected: self.admission_rejected.load(Relaxed),
            control_send_errors: self.control_send_errors.load(Relaxed),
        }
    }
}
