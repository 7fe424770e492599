// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Session directory and lifecycle.
//!
//! One primary map keyed by session id, with secondary indexes by SSRC
//! and by user-session id, plus a per-IP counter for admission checks.
//! All mutation goes through the manager; sessions themselves only carry
//! state. The janitor task evicts idle and over-age sessions unless the
//! owner is bypassed.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sdrmux_core::status::unix_millis;

use crate::config::SessionsConfig;
use crate::controller::{ChannelUpdate, RadioController, Squelch};
use crate::error::SessionError;
use crate::limiter::Limiters;
use crate::metrics::GatewayMetrics;
use crate::net::BypassSet;
use crate::session::{Session, SessionKind, SessionSummary, Tuning};

/// Everything a create request carries.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Channel label, used in logs and back-end bookkeeping.
    pub name: String,
    /// Opaque key grouping sessions of one human.
    pub user_session_id: String,
    pub client_ip: IpAddr,
    pub bypass_password: Option<String>,
    pub tuning: Tuning,
}

/// Partial retune; absent fields keep their current value.
#[derive(Debug, Clone)]
pub enum TuningUpdate {
    Audio {
        frequency_hz: Option<f64>,
        preset: Option<String>,
        low_edge_hz: Option<f32>,
        high_edge_hz: Option<f32>,
        squelch: Option<Squelch>,
    },
    Spectrum {
        frequency_hz: Option<f64>,
        bin_count: Option<u32>,
        bin_bandwidth_hz: Option<f32>,
    },
}

#[derive(Debug, Default)]
struct IpCount {
    total: usize,
    unbypassed: usize,
}

/// SSRC 0 is reserved. Released SSRCs sit in `pending` until the next
/// janitor tick so a destroy-create pair never hands the same SSRC
/// straight back.
struct SsrcPool {
    free: Vec<u32>,
    pending: Vec<u32>,
    next: u32,
}

impl Default for SsrcPool {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            pending: Vec::new(),
            next: 1,
        }
    }
}

impl SsrcPool {
    fn allocate(&mut self) -> u32 {
        self.free.pop().unwrap_or_else(|| {
            let ssrc = self.next;
            self.next += 1;
            ssrc
        })
    }

    fn release(&mut self, ssrc: u32) {
        if ssrc != 0 {
            self.pending.push(ssrc);
        }
    }

    fn reclaim(&mut self) {
        self.free.append(&mut self.pending);
    }
}

#[derive(Default)]
struct Directory {
    by_id: HashMap<String, Arc<Session>>,
    by_ssrc: HashMap<u32, Arc<Session>>,
    by_user: HashMap<String, HashSet<String>>,
    ip_counts: HashMap<IpAddr, IpCount>,
    ssrc_pool: SsrcPool,
}

impl Directory {
    fn insert(&mut self, session: &Arc<Session>) {
        self.by_id.insert(session.id.clone(), Arc::clone(session));
        self.by_ssrc.insert(session.ssrc, Arc::clone(session));
        self.by_user
            .entry(session.user_session_id.clone())
            .or_default()
            .insert(session.id.clone());
        let count = self.ip_counts.entry(session.client_ip).or_default();
        count.total += 1;
        if !session.bypass {
            count.unbypassed += 1;
        }
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Session>> {
        let session = self.by_id.remove(id)?;
        self.by_ssrc.remove(&session.ssrc);
        if let Some(ids) = self.by_user.get_mut(&session.user_session_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_user.remove(&session.user_session_id);
            }
        }
        if let Some(count) = self.ip_counts.get_mut(&session.client_ip) {
            count.total = count.total.saturating_sub(1);
            if !session.bypass {
                count.unbypassed = count.unbypassed.saturating_sub(1);
            }
            if count.total == 0 {
                self.ip_counts.remove(&session.client_ip);
            }
        }
        Some(session)
    }
}

pub struct SessionManager {
    cfg: SessionsConfig,
    bypass: BypassSet,
    controller: Arc<RadioController>,
    limiters: Arc<Limiters>,
    metrics: Arc<GatewayMetrics>,
    dir: RwLock<Directory>,
}

impl SessionManager {
    pub fn new(
        cfg: SessionsConfig,
        bypass: BypassSet,
        controller: Arc<RadioController>,
        limiters: Arc<Limiters>,
        metrics: Arc<GatewayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            bypass,
            controller,
            limiters,
            metrics,
            dir: RwLock::new(Directory::default()),
        })
    }

    fn reject(&self, err: SessionError) -> SessionError {
        self.metrics
            .admission_rejected
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        err
    }

    /// Admit, allocate an SSRC, instruct the radio, register. On a
    /// control failure the registration is rolled back and the error
    /// reported; nothing is left behind.
    pub async fn create(&self, req: CreateRequest) -> Result<Arc<Session>, SessionError> {
        let now_ms = unix_millis();
        let bypass = self
            .bypass
            .bypassed(req.client_ip, req.bypass_password.as_deref());

        if !bypass && !self.limiters.session_open.allow(&req.client_ip) {
            return Err(self.reject(SessionError::RateLimited));
        }

        let session = {
            let mut dir = self.dir.write().expect("session directory poisoned");
            if dir.by_id.len() >= self.cfg.max_sessions {
                return Err(self.reject(SessionError::CapacityExhausted(self.cfg.max_sessions)));
            }
            if self.cfg.max_sessions_per_ip > 0 && !bypass {
                let unbypassed = dir
                    .ip_counts
                    .get(&req.client_ip)
                    .map(|c| c.unbypassed)
                    .unwrap_or(0);
                if unbypassed >= self.cfg.max_sessions_per_ip {
                    return Err(self.reject(SessionError::PerIpLimit(req.client_ip)));
                }
            }
            if self.cfg.max_sessions_per_user > 0 && !bypass {
                let owned = dir
                    .by_user
                    .get(&req.user_session_id)
                    .map(|ids| ids.len())
                    .unwrap_or(0);
                if owned >= self.cfg.max_sessions_per_user {
                    return Err(self.reject(SessionError::PerUserLimit));
                }
            }
            let ssrc = dir.ssrc_pool.allocate();
            let session = Session::new(
                ssrc,
                req.user_session_id.clone(),
                req.client_ip,
                req.tuning.clone(),
                bypass,
                now_ms,
            );
            dir.insert(&session);
            session
        };

        let created = match &req.tuning {
            Tuning::Audio {
                frequency_hz,
                preset,
                low_edge_hz,
                high_edge_hz,
                squelch,
            } => {
                let edges = match (low_edge_hz, high_edge_hz) {
                    (Some(low), Some(high)) => Some((*low, *high)),
                    _ => None,
                };
                self.controller
                    .create_channel(&req.name, *frequency_hz, preset, session.ssrc, edges, *squelch)
                    .await
            }
            Tuning::Spectrum {
                frequency_hz,
                bin_count,
                bin_bandwidth_hz,
            } => {
                self.controller
                    .create_spectrum_channel(
                        &req.name,
                        *frequency_hz,
                        *bin_count,
                        *bin_bandwidth_hz,
                        session.ssrc,
                    )
                    .await
            }
        };
        if let Err(e) = created {
            let mut dir = self.dir.write().expect("session directory poisoned");
            dir.remove(&session.id);
            dir.ssrc_pool.release(session.ssrc);
            drop(dir);
            session.terminate();
            return Err(e.into());
        }

        info!(
            "session {} created: {:?} ssrc {:#010x} for {} ({})",
            session.id,
            session.kind,
            session.ssrc,
            req.client_ip,
            req.user_session_id
        );
        Ok(session)
    }

    /// Retune an existing session. Only the owning user may update, and
    /// tuning commands are rate limited per user and channel kind.
    pub async fn update(
        &self,
        id: &str,
        principal: &str,
        update: TuningUpdate,
    ) -> Result<(), SessionError> {
        let session = self
            .lookup(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.user_session_id != principal {
            return Err(SessionError::NotOwner(id.to_string()));
        }
        let allowed = match session.kind {
            SessionKind::Audio => self.limiters.commands.allow_audio(principal),
            SessionKind::Spectrum => self.limiters.commands.allow_spectrum(principal),
        };
        if !allowed && !session.bypass {
            return Err(SessionError::RateLimited);
        }

        match (update, session.tuning()) {
            (
                TuningUpdate::Audio {
                    frequency_hz,
                    preset,
                    low_edge_hz,
                    high_edge_hz,
                    squelch,
                },
                Tuning::Audio {
                    frequency_hz: old_frequency,
                    preset: old_preset,
                    low_edge_hz: old_low,
                    high_edge_hz: old_high,
                    squelch: old_squelch,
                },
            ) => {
                let send_edges = low_edge_hz.is_some() || high_edge_hz.is_some();
                let merged_low = low_edge_hz.or(old_low);
                let merged_high = high_edge_hz.or(old_high);
                let channel_update = ChannelUpdate {
                    frequency_hz,
                    preset: preset.clone(),
                    low_edge_hz: merged_low,
                    high_edge_hz: merged_high,
                    send_edges,
                    squelch,
                };
                self.controller
                    .update_channel(session.ssrc, &channel_update)
                    .await?;
                session.set_tuning(Tuning::Audio {
                    frequency_hz: frequency_hz.unwrap_or(old_frequency),
                    preset: preset.unwrap_or(old_preset),
                    low_edge_hz: merged_low,
                    high_edge_hz: merged_high,
                    squelch: squelch.or(old_squelch),
                });
            }
            (
                TuningUpdate::Spectrum {
                    frequency_hz,
                    bin_count,
                    bin_bandwidth_hz,
                },
                Tuning::Spectrum {
                    frequency_hz: old_frequency,
                    bin_count: old_bins,
                    bin_bandwidth_hz: old_bw,
                },
            ) => {
                let merged_frequency = frequency_hz.unwrap_or(old_frequency);
                let merged_bins = bin_count.unwrap_or(old_bins);
                let merged_bw = bin_bandwidth_hz.unwrap_or(old_bw);
                self.controller
                    .update_spectrum_channel(
                        session.ssrc,
                        merged_frequency,
                        merged_bins,
                        merged_bw,
                        bin_count.is_some(),
                    )
                    .await?;
                session.set_tuning(Tuning::Spectrum {
                    frequency_hz: merged_frequency,
                    bin_count: merged_bins,
                    bin_bandwidth_hz: merged_bw,
                });
            }
            _ => return Err(SessionError::KindMismatch),
        }

        session.touch(unix_millis());
        Ok(())
    }

    /// Keepalive; refreshes last-active only.
    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .lookup(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.touch(unix_millis());
        Ok(())
    }

    /// Tear a session down: indexes out, delivery closed, done
    /// signalled, channel disabled best-effort, SSRC released once the
    /// disable has been written. Destroying a dead id is a no-op.
    pub async fn destroy(&self, id: &str) -> bool {
        let session = {
            self.dir
                .write()
                .expect("session directory poisoned")
                .remove(id)
        };
        let Some(session) = session else {
            return false;
        };
        session.terminate();
        if let Err(e) = self.controller.disable_channel(session.ssrc).await {
            warn!("disable for session {} failed: {}", session.id, e);
        }
        {
            let mut dir = self.dir.write().expect("session directory poisoned");
            dir.ssrc_pool.release(session.ssrc);
            if !dir.by_user.contains_key(&session.user_session_id) {
                self.limiters.commands.remove_user(&session.user_session_id);
            }
        }
        info!(
            "session {} destroyed (ssrc {:#010x}, {} queue drops)",
            session.id,
            session.ssrc,
            session.queue_drops()
        );
        true
    }

    /// Tear down every session belonging to one user, on disconnect.
    pub async fn destroy_user(&self, user_session_id: &str) -> usize {
        let ids: Vec<String> = {
            let dir = self.dir.read().expect("session directory poisoned");
            dir.by_user
                .get(user_session_id)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default()
        };
        let mut destroyed = 0;
        for id in ids {
            if self.destroy(&id).await {
                destroyed += 1;
            }
        }
        destroyed
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.dir
            .read()
            .expect("session directory poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    pub fn lookup_by_ssrc(&self, ssrc: u32) -> Option<Arc<Session>> {
        self.dir
            .read()
            .expect("session directory poisoned")
            .by_ssrc
            .get(&ssrc)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.dir.read().expect("session directory poisoned").by_id.len()
    }

    pub fn count_by_ip(&self, ip: IpAddr) -> usize {
        self.dir
            .read()
            .expect("session directory poisoned")
            .ip_counts
            .get(&ip)
            .map(|c| c.total)
            .unwrap_or(0)
    }

    pub fn count_non_bypassed(&self, ip: IpAddr) -> usize {
        self.dir
            .read()
            .expect("session directory poisoned")
            .ip_counts
            .get(&ip)
            .map(|c| c.unbypassed)
            .unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.dir
            .read()
            .expect("session directory poisoned")
            .by_id
            .values()
            .cloned()
            .collect()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions().iter().map(|s| s.summary()).collect()
    }

    /// The exemption policy, for collaborators making their own checks.
    pub fn bypass(&self) -> &BypassSet {
        &self.bypass
    }

    /// One janitor pass: evict expired sessions and reclaim released
    /// SSRCs. Bypassed sessions are never evicted.
    pub async fn sweep(&self, now_ms: u64) -> usize {
        let idle_ms = self.cfg.idle_timeout_secs * 1000;
        let max_ms = self.cfg.max_lifetime_secs * 1000;
        let expired: Vec<Arc<Session>> = {
            let dir = self.dir.read().expect("session directory poisoned");
            dir.by_id
                .values()
                .filter(|s| {
                    !s.bypass
                        && !self.bypass.ip_bypassed(s.client_ip)
                        && s.expired(now_ms, idle_ms, max_ms)
                })
                .cloned()
                .collect()
        };

        let mut kicked_audio = 0u64;
        let mut kicked_spectrum = 0u64;
        for session in expired {
            let idle_secs = now_ms.saturating_sub(session.last_active_ms()) / 1000;
            info!(
                "janitor evicting session {} ({:?}, idle {} s)",
                session.id, session.kind, idle_secs
            );
            if self.destroy(&session.id).await {
                match session.kind {
                    SessionKind::Audio => kicked_audio += 1,
                    SessionKind::Spectrum => kicked_spectrum += 1,
                }
            }
        }
        use std::sync::atomic::Ordering::Relaxed;
        self.metrics.kicked_audio.fetch_add(kicked_audio, Relaxed);
        self.metrics.kicked_spectrum.fetch_add(kicked_spectrum, Relaxed);
        // A pass that takes out both kinds counts once as mixed.
        if kicked_audio > 0 && kicked_spectrum > 0 {
            self.metrics.kicked_mixed.fetch_add(1, Relaxed);
        }
        let kicked = (kicked_audio + kicked_spectrum) as usize;

        self.dir
            .write()
            .expect("session directory poisoned")
            .ssrc_pool
            .reclaim();
        kicked
    }

    pub async fn run_janitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.cfg.janitor_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let kicked = self.sweep(unix_millis()).await;
                    if kicked > 0 {
                        debug!("janitor kicked {} sessions", kicked);
                    }
                }
            }
        }
        debug!("janitor stopped");
    }
}
