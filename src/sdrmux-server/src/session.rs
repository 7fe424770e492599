// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-tuning session state.
//!
//! A session is one client tuning: an audio session owns one demodulated
//! stream, a spectrum session one FFT stream. Identity (id, SSRC, user
//! session) is fixed for the session's lifetime; only the tuning and the
//! last-active stamp move.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::controller::Squelch;

/// Delivery queue depth for audio, sized so roughly one second of 20 ms
/// frames buffers without blocking the receiver.
const AUDIO_QUEUE_FRAMES: usize = 64;
const SPECTRUM_QUEUE_FRAMES: usize = 16;

/// One demodulated PCM frame as it came off the data group.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub rtp_timestamp: u32,
    pub samples: Vec<i16>,
}

/// One FFT frame, `bins` in dBFS.
#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    pub rtp_timestamp: u32,
    pub bins: Vec<f32>,
}

/// Bounded frame queue with drop-oldest back-pressure: streaming latency
/// beats completeness, so a full queue sheds its oldest frame for the
/// newest one. Displaced frames are counted.
#[derive(Debug)]
pub struct FrameQueue<T> {
    cap: usize,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    drops: AtomicU64,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> FrameQueue<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(cap),
                closed: false,
            }),
            notify: Notify::new(),
            drops: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, displacing the oldest when full. Returns whether
    /// a frame was dropped. Pushes after close are discarded.
    pub fn push(&self, item: T) -> bool {
        let dropped;
        {
            let mut state = self.state.lock().expect("frame queue mutex poisoned");
            if state.closed {
                return false;
            }
            dropped = if state.items.len() >= self.cap {
                state.items.pop_front();
                self.drops.fetch_add(1, Relaxed);
                true
            } else {
                false
            };
            state.items.push_back(item);
        }
        self.notify.notify_one();
        dropped
    }

    /// Wait for the next frame; `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().expect("frame queue mutex poisoned");
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state
            .lock()
            .expect("frame queue mutex poisoned")
            .items
            .pop_front()
    }

    /// Close and wake every waiter. Buffered frames stay poppable.
    pub fn close(&self) {
        self.state.lock().expect("frame queue mutex poisoned").closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("frame queue mutex poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Audio,
    Spectrum,
}

/// Tuning parameters, by session kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Tuning {
    Audio {
        frequency_hz: f64,
        preset: String,
        low_edge_hz: Option<f32>,
        high_edge_hz: Option<f32>,
        squelch: Option<Squelch>,
    },
    Spectrum {
        frequency_hz: f64,
        bin_count: u32,
        bin_bandwidth_hz: f32,
    },
}

impl Tuning {
    pub fn kind(&self) -> SessionKind {
        match self {
            Tuning::Audio { .. } => SessionKind::Audio,
            Tuning::Spectrum { .. } => SessionKind::Spectrum,
        }
    }

    pub fn frequency_hz(&self) -> f64 {
        match self {
            Tuning::Audio { frequency_hz, .. } | Tuning::Spectrum { frequency_hz, .. } => {
                *frequency_hz
            }
        }
    }
}

/// Frame sink for the session's kind.
#[derive(Debug)]
pub enum Delivery {
    Audio(Arc<FrameQueue<AudioFrame>>),
    Spectrum(Arc<FrameQueue<SpectrumFrame>>),
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub ssrc: u32,
    /// Opaque grouping key for sessions belonging to one human. Formed by
    /// the protocol wrappers; never interpreted here.
    pub user_session_id: String,
    pub client_ip: IpAddr,
    pub kind: SessionKind,
    /// Exempt from idle/lifetime eviction, fixed at creation.
    pub bypass: bool,
    pub created_ms: u64,
    last_active_ms: AtomicU64,
    tuning: Mutex<Tuning>,
    delivery: Delivery,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Session {
    pub(crate) fn new(
        ssrc: u32,
        user_session_id: String,
        client_ip: IpAddr,
        tuning: Tuning,
        bypass: bool,
        now_ms: u64,
    ) -> Arc<Self> {
        let kind = tuning.kind();
        let delivery = match kind {
            SessionKind::Audio => Delivery::Audio(Arc::new(FrameQueue::new(AUDIO_QUEUE_FRAMES))),
            SessionKind::Spectrum => {
                Delivery::Spectrum(Arc::new(FrameQueue::new(SPECTRUM_QUEUE_FRAMES)))
            }
        };
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            ssrc,
            user_session_id,
            client_ip,
            kind,
            bypass,
            created_ms: now_ms,
            last_active_ms: AtomicU64::new(now_ms),
            tuning: Mutex::new(tuning),
            delivery,
            done_tx,
            done_rx,
        })
    }

    /// Any client keepalive refreshes last-active and nothing else.
    pub fn touch(&self, now_ms: u64) {
        self.last_active_ms.store(now_ms, Relaxed);
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Relaxed)
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning.lock().expect("tuning mutex poisoned").clone()
    }

    pub(crate) fn set_tuning(&self, tuning: Tuning) {
        *self.tuning.lock().expect("tuning mutex poisoned") = tuning;
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn audio_queue(&self) -> Option<Arc<FrameQueue<AudioFrame>>> {
        match &self.delivery {
            Delivery::Audio(q) => Some(Arc::clone(q)),
            Delivery::Spectrum(_) => None,
        }
    }

    pub fn spectrum_queue(&self) -> Option<Arc<FrameQueue<SpectrumFrame>>> {
        match &self.delivery {
            Delivery::Spectrum(q) => Some(Arc::clone(q)),
            Delivery::Audio(_) => None,
        }
    }

    /// Cloneable termination signal; flips to true exactly once.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Close delivery first, then signal done, so waiters on either
    /// unblock cleanly.
    pub(crate) fn terminate(&self) {
        match &self.delivery {
            Delivery::Audio(q) => q.close(),
            Delivery::Spectrum(q) => q.close(),
        }
        let _ = self.done_tx.send(true);
    }

    pub fn queue_drops(&self) -> u64 {
        match &self.delivery {
            Delivery::Audio(q) => q.drops(),
            Delivery::Spectrum(q) => q.drops(),
        }
    }

    /// Eviction test for the janitor; a zero timeout disables that check.
    pub fn expired(&self, now_ms: u64, idle_timeout_ms: u64, max_lifetime_ms: u64) -> bool {
        if idle_timeout_ms > 0 && now_ms.saturating_sub(self.last_active_ms()) >= idle_timeout_ms {
            return true;
        }
        max_lifetime_ms > 0 && now_ms.saturating_sub(self.created_ms) >= max_lifetime_ms
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            ssrc: self.ssrc,
            kind: self.kind,
            user_session_id: self.user_session_id.clone(),
            client_ip: self.client_ip,
            tuning: self.tuning(),
            created_ms: self.created_ms,
            last_active_ms: self.last_active_ms(),
            queue_drops: self.queue_drops(),
            bypass: self.bypass,
        }
    }
}

/// Serializable per-session record for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub ssrc: u32,
    pub kind: SessionKind,
    pub user_session_id: String,
    pub client_ip: IpAddr,
    pub tuning: Tuning,
    pub created_ms: u64,
    pub last_active_ms: u64,
    pub queue_drops: u64,
    pub bypass: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn audio_tuning() -> Tuning {
        Tuning::Audio {
            frequency_hz: 14_074_000.0,
            preset: "usb".to_string(),
            low_edge_hz: None,
            high_edge_hz: None,
            squelch: None,
        }
    }

    fn session() -> Arc<Session> {
        Session::new(
            7,
            "user-a".to_string(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            audio_tuning(),
            false,
            1_000,
        )
    }

    #[test]
    fn test_queue_drop_oldest() {
        let queue = FrameQueue::new(2);
        assert!(!queue.push(1));
        assert!(!queue.push(2));
        // Full: 1 is displaced in favour of 3.
        assert!(queue.push(3));
        assert_eq!(queue.drops(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_queue_pop_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(4));
        let popper = Arc::clone(&queue);
        let task = tokio::spawn(async move { popper.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(42);
        assert_eq!(task.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_queue_close_unblocks_popper() {
        let queue = Arc::new(FrameQueue::<u32>::new(4));
        let popper = Arc::clone(&queue);
        let task = tokio::spawn(async move { popper.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_drains_before_reporting_closed() {
        let queue = FrameQueue::new(4);
        queue.push(1);
        queue.close();
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
        // Pushes after close are discarded.
        assert!(!queue.push(2));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_session_identity_and_kind() {
        let s = session();
        assert_eq!(s.kind, SessionKind::Audio);
        assert!(s.audio_queue().is_some());
        assert!(s.spectrum_queue().is_none());
        assert_ne!(s.id, session().id);
    }

    #[test]
    fn test_touch_refreshes_only_last_active() {
        let s = session();
        let before = s.tuning().frequency_hz();
        s.touch(5_000);
        assert_eq!(s.last_active_ms(), 5_000);
        assert_eq!(s.created_ms, 1_000);
        assert_eq!(s.tuning().frequency_hz(), before);
    }

    #[test]
    fn test_expiry_rules() {
        let s = session();
        // Idle timeout.
        assert!(!s.expired(2_000, 5_000, 0));
        assert!(s.expired(6_100, 5_000, 0));
        // Max lifetime fires regardless of activity.
        s.touch(9_000);
        assert!(!s.expired(9_001, 5_000, 0));
        assert!(s.expired(9_001, 0, 8_000));
        // Both disabled: never expires.
        assert!(!s.expired(u64::MAX, 0, 0));
    }

    #[tokio::test]
    async fn test_terminate_closes_queue_then_done() {
        let s = session();
        let mut done = s.done();
        assert!(!*done.borrow());
        let queue = s.audio_queue().unwrap();
        s.terminate();
        assert_eq!(queue.pop().await, None);
        done.changed().await.unwrap();
        assert!(*done.borrow());
    }

    #[test]
    fn test_summary_serializes() {
        let json = serde_json::to_string(&session().summary()).unwrap();
        assert!(json.contains("\"kind\":\"audio\""));
        assert!(json.contains("\"ssrc\":7"));
    }
}
