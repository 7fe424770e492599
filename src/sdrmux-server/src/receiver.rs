// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Data-plane receiver.
//!
//! One task owns the RTP multicast socket, demultiplexes by SSRC, puts
//! datagrams back into sequence order inside a small per-SSRC window, and
//! feeds the owning session's delivery queue. Unknown SSRCs, stale
//! packets and duplicates are dropped and counted.

use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

use sdrmux_core::rtp::{pcm_samples, spectrum_bins, RtpHeader};

use crate::manager::SessionManager;
use crate::metrics::GatewayMetrics;
use crate::session::{AudioFrame, Delivery, Session, SpectrumFrame};

/// Reorder depth per SSRC. Small on purpose: the constant factor matters
/// on this hot path, and anything later than a few packets is already
/// stale for live audio.
pub const REORDER_WINDOW: usize = 8;

/// What happened to one pushed packet.
#[derive(Debug, Default)]
pub struct PushOutcome<T> {
    /// Packets released in sequence order, oldest first.
    pub delivered: Vec<T>,
    /// The packet was older than the window.
    pub stale: bool,
    /// A packet with this sequence number is already buffered.
    pub duplicate: bool,
}

impl<T> PushOutcome<T> {
    fn delivered(items: Vec<T>) -> Self {
        Self {
            delivered: items,
            stale: false,
            duplicate: false,
        }
    }
}

/// Sequence-number reorder ring for one SSRC.
///
/// `pending[d - 1]` holds the packet `d` sequence numbers ahead of the
/// next expected one. Arrivals beyond the window flush whatever is
/// buffered and resynchronize.
pub struct ReorderWindow<T> {
    next_seq: Option<u16>,
    pending: Vec<Option<T>>,
}

impl<T> Default for ReorderWindow<T> {
    fn default() -> Self {
        Self {
            next_seq: None,
            pending: Vec::new(),
        }
    }
}

impl<T> ReorderWindow<T> {
    pub fn push(&mut self, seq: u16, value: T) -> PushOutcome<T> {
        let Some(base) = self.next_seq else {
            self.next_seq = Some(seq.wrapping_add(1));
            return PushOutcome::delivered(vec![value]);
        };

        let delta = seq.wrapping_sub(base);
        if delta >= 0x8000 {
            // Behind the window: a late straggler or a duplicate of a
            // delivered packet.
            return PushOutcome {
                delivered: Vec::new(),
                stale: true,
                duplicate: false,
            };
        }
        let delta = usize::from(delta);

        if delta == 0 {
            let mut delivered = vec![value];
            let mut base = base.wrapping_add(1);
            // The front slot always corresponds to the next expected
            // sequence number: drain buffered runs, shift out gaps.
            while !self.pending.is_empty() {
                match self.pending.remove(0) {
                    Some(buffered) => {
                        delivered.push(buffered);
                        base = base.wrapping_add(1);
                    }
                    None => break,
                }
            }
            self.next_seq = Some(base);
            return PushOutcome::delivered(delivered);
        }

        if delta < REORDER_WINDOW {
            if self.pending.len() < delta {
                self.pending.resize_with(delta, || None);
            }
            let slot = &mut self.pending[delta - 1];
            if slot.is_some() {
                return PushOutcome {
                    delivered: Vec::new(),
                    stale: false,
                    duplicate: true,
                };
            }
            *slot = Some(value);
            return PushOutcome::delivered(Vec::new());
        }

        // Jumped past the window: release what we have, in order, and
        // resynchronize on the new sequence position.
        let mut delivered: Vec<T> = self.pending.drain(..).flatten().collect();
        delivered.push(value);
        self.next_seq = Some(seq.wrapping_add(1));
        PushOutcome::delivered(delivered)
    }
}

/// A payload waiting for its place in the sequence.
struct PendingPacket {
    timestamp: u32,
    payload: Vec<u8>,
}

fn deliver(session: &Session, timestamp: u32, payload: &[u8], metrics: &GatewayMetrics) {
    let dropped = match session.delivery() {
        Delivery::Audio(queue) => queue.push(AudioFrame {
            rtp_timestamp: timestamp,
            samples: pcm_samples(payload),
        }),
        Delivery::Spectrum(queue) => queue.push(SpectrumFrame {
            rtp_timestamp: timestamp,
            bins: spectrum_bins(payload),
        }),
    };
    if dropped {
        metrics.queue_drops.fetch_add(1, Relaxed);
    }
}

/// Receiver task for the data group. Exits on shutdown.
pub async fn run_data_receiver(
    socket: UdpSocket,
    manager: Arc<SessionManager>,
    metrics: Arc<GatewayMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Spectrum frames run to several kilobytes; size for the largest
    // reassembled datagram rather than one MTU.
    let mut buf = vec![0u8; 65536];
    let mut windows: HashMap<u32, ReorderWindow<PendingPacket>> = HashMap::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, _from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("data socket read failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let datagram = &buf[..len];
                let header = match RtpHeader::parse(datagram) {
                    Ok(h) => h,
                    Err(e) => {
                        metrics.malformed_rtp.fetch_add(1, Relaxed);
                        debug!("malformed RTP datagram: {}", e);
                        continue;
                    }
                };
                let Some(session) = manager.lookup_by_ssrc(header.ssrc) else {
                    metrics.unknown_ssrc.fetch_add(1, Relaxed);
                    windows.remove(&header.ssrc);
                    continue;
                };

                let window = windows.entry(header.ssrc).or_default();
                let outcome = window.push(
                    header.sequence,
                    PendingPacket {
                        timestamp: header.timestamp,
                        payload: header.payload(datagram).to_vec(),
                    },
                );
                if outcome.stale {
                    metrics.stale_packets.fetch_add(1, Relaxed);
                }
                if outcome.duplicate {
                    metrics.duplicate_packets.fetch_add(1, Relaxed);
                }
                for packet in outcome.delivered {
                    deliver(&session, packet.timestamp, &packet.payload, &metrics);
                }
            }
        }
    }
    debug!("data receiver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, SessionsConfig};
    use crate::controller::RadioController;
    use crate::limiter::Limiters;
    use crate::manager::CreateRequest;
    use crate::net::BypassSet;
    use crate::session::Tuning;

    fn seqs(outcome: &PushOutcome<u16>) -> Vec<u16> {
        outcome.delivered.clone()
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut window = ReorderWindow::default();
        assert_eq!(seqs(&window.push(1, 1)), vec![1]);
        assert_eq!(seqs(&window.push(2, 2)), vec![2]);
        assert_eq!(seqs(&window.push(3, 3)), vec![3]);
    }

    #[test]
    fn test_reorder_within_window() {
        let mut window = ReorderWindow::default();
        assert_eq!(seqs(&window.push(1, 1)), vec![1]);
        // 3 arrives early and waits for 2.
        assert_eq!(seqs(&window.push(3, 3)), Vec::<u16>::new());
        assert_eq!(seqs(&window.push(2, 2)), vec![2, 3]);
        assert_eq!(seqs(&window.push(4, 4)), vec![4]);
    }

    #[test]
    fn test_gap_held_until_fill() {
        let mut window = ReorderWindow::default();
        window.push(10, 10);
        assert!(window.push(13, 13).delivered.is_empty());
        assert!(window.push(12, 12).delivered.is_empty());
        // 11 releases the whole run.
        assert_eq!(seqs(&window.push(11, 11)), vec![11, 12, 13]);
    }

    #[test]
    fn test_stale_packet_dropped() {
        let mut window = ReorderWindow::default();
        window.push(10, 10);
        window.push(11, 11);
        let outcome = window.push(9, 9);
        assert!(outcome.stale);
        assert!(outcome.delivered.is_empty());
    }

    #[test]
    fn test_duplicate_in_window_dropped() {
        let mut window = ReorderWindow::default();
        window.push(1, 1);
        window.push(3, 3);
        let outcome = window.push(3, 3);
        assert!(outcome.duplicate);
    }

    #[test]
    fn test_jump_past_window_flushes_and_resyncs() {
        let mut window = ReorderWindow::default();
        window.push(1, 1);
        window.push(3, 3);
        // 100 is far beyond the window: 3 flushes out, 100 follows, and
        // the window recenters.
        assert_eq!(seqs(&window.push(100, 100)), vec![3, 100]);
        assert_eq!(seqs(&window.push(101, 101)), vec![101]);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut window = ReorderWindow::default();
        assert_eq!(seqs(&window.push(65534, 65534)), vec![65534]);
        assert_eq!(seqs(&window.push(65535, 65535)), vec![65535]);
        assert_eq!(seqs(&window.push(0, 0)), vec![0]);
        assert_eq!(seqs(&window.push(1, 1)), vec![1]);
    }

    #[test]
    fn test_interleaved_ssrcs_stay_independent() {
        // Two windows as the receiver keeps them, fed with interleaved
        // sequence numbers.
        let mut window_a = ReorderWindow::default();
        let mut window_b = ReorderWindow::default();
        let mut got_a = Vec::new();
        let mut got_b = Vec::new();

        got_a.extend(seqs(&window_a.push(1, 1)));
        got_b.extend(seqs(&window_b.push(10, 10)));
        got_a.extend(seqs(&window_a.push(3, 3)));
        got_b.extend(seqs(&window_b.push(11, 11)));
        got_a.extend(seqs(&window_a.push(2, 2)));

        assert_eq!(got_a, vec![1, 2, 3]);
        assert_eq!(got_b, vec![10, 11]);
    }

    fn rtp_datagram(seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x80, 122];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_receiver_delivers_ordered_audio() {
        // Control socket plumbing for the manager.
        let control_rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let group = match control_rx.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let metrics = Arc::new(GatewayMetrics::default());
        let controller = Arc::new(RadioController::new(control, group, Arc::clone(&metrics)));
        let limiters = Arc::new(Limiters::new(&LimitsConfig::default()));
        let manager = SessionManager::new(
            SessionsConfig::default(),
            BypassSet::default(),
            controller,
            limiters,
            Arc::clone(&metrics),
        );

        let session = manager
            .create(CreateRequest {
                name: "test".to_string(),
                user_session_id: "user-a".to_string(),
                client_ip: "10.0.0.5".parse().unwrap(),
                bypass_password: None,
                tuning: Tuning::Audio {
                    frequency_hz: 14_074_000.0,
                    preset: "usb".to_string(),
                    low_edge_hz: None,
                    high_edge_hz: None,
                    squelch: None,
                },
            })
            .await
            .unwrap();

        // Data path: receiver task on one localhost socket, sender on
        // another.
        let data_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let data_addr = data_socket.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_data_receiver(
            data_socket,
            Arc::clone(&manager),
            Arc::clone(&metrics),
            shutdown_rx,
        ));

        let ssrc = session.ssrc;
        // Out of order on purpose; one unknown SSRC in the middle.
        for (seq, ts) in [(1u16, 100u32), (3, 300), (2, 200)] {
            let sample = (seq as i16).to_be_bytes();
            sender
                .send_to(&rtp_datagram(seq, ts, ssrc, &sample), data_addr)
                .await
                .unwrap();
        }
        sender
            .send_to(&rtp_datagram(1, 1, 0xDEAD, &[0, 1]), data_addr)
            .await
            .unwrap();

        let queue = session.audio_queue().unwrap();
        let mut timestamps = Vec::new();
        for _ in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(2), queue.pop())
                .await
                .unwrap()
                .unwrap();
            timestamps.push(frame.rtp_timestamp);
        }
        assert_eq!(timestamps, vec![100, 200, 300]);

        // The unknown SSRC was counted, not delivered.
        for _ in 0..50 {
            if metrics.snapshot().unknown_ssrc > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.snapshot().unknown_ssrc, 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
