// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Token buckets guarding every command path and endpoint.
//!
//! One reusable bucket plus typed managers keyed by user, IP, or
//! IP-and-subkey. Buckets lock individually so hot paths never contend on
//! a manager-wide mutex; the manager map itself is read-mostly.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::LimitsConfig;

/// A refill rate at or below zero disables the limit entirely.
#[derive(Debug)]
pub struct TokenBucket {
    max: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(refill_per_sec: f64, max: f64) -> Self {
        Self {
            max,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: max,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Refill from elapsed wall time, then try to take one token.
    pub fn allow_at(&self, now: Instant) -> bool {
        if self.refill_per_sec <= 0.0 {
            return true;
        }
        let mut state = self.state.lock().expect("token bucket mutex poisoned");
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.max);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time since the bucket was last touched, for idle eviction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let state = self.state.lock().expect("token bucket mutex poisoned");
        now.saturating_duration_since(state.last_refill)
    }
}

/// Directory cardinality reported to metrics. For two-level keys `keys`
/// counts distinct primary keys and `leaves` counts buckets.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimiterStats {
    pub keys: usize,
    pub leaves: usize,
}

/// Map of independent buckets sharing one rate.
pub struct KeyedLimiter<K> {
    refill_per_sec: f64,
    max: f64,
    buckets: RwLock<HashMap<K, Arc<TokenBucket>>>,
}

impl<K: Eq + Hash + Clone> KeyedLimiter<K> {
    pub fn new(refill_per_sec: f64, max: f64) -> Self {
        Self {
            refill_per_sec,
            max,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn bucket(&self, key: &K) -> Arc<TokenBucket> {
        self.bucket_with(key, |_| (self.refill_per_sec, self.max))
    }

    fn bucket_with(&self, key: &K, rate_for: impl Fn(&K) -> (f64, f64)) -> Arc<TokenBucket> {
        {
            let buckets = self.buckets.read().expect("limiter map poisoned");
            if let Some(b) = buckets.get(key) {
                return Arc::clone(b);
            }
        }
        let mut buckets = self.buckets.write().expect("limiter map poisoned");
        Arc::clone(buckets.entry(key.clone()).or_insert_with(|| {
            let (rate, max) = rate_for(key);
            Arc::new(TokenBucket::new(rate, max))
        }))
    }

    pub fn allow(&self, key: &K) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &K, now: Instant) -> bool {
        self.bucket(key).allow_at(now)
    }

    pub fn remove(&self, key: &K) {
        self.buckets.write().expect("limiter map poisoned").remove(key);
    }

    /// Evict buckets untouched for longer than the idle window.
    pub fn cleanup(&self, idle_window: Duration) -> usize {
        self.cleanup_at(idle_window, Instant::now())
    }

    pub fn cleanup_at(&self, idle_window: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.write().expect("limiter map poisoned");
        let before = buckets.len();
        buckets.retain(|_, b| b.idle_for(now) < idle_window);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().expect("limiter map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Typed managers
// ---------------------------------------------------------------------------

struct UserBuckets {
    audio: TokenBucket,
    spectrum: TokenBucket,
}

/// Per-user tuning-command limiter with separate audio and spectrum
/// buckets, so a runaway spectrum display cannot starve audio retunes.
pub struct CommandLimiter {
    rate_per_sec: f64,
    users: RwLock<HashMap<String, Arc<UserBuckets>>>,
}

impl CommandLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            rate_per_sec,
            users: RwLock::new(HashMap::new()),
        }
    }

    fn user(&self, user_session_id: &str) -> Arc<UserBuckets> {
        {
            let users = self.users.read().expect("command limiter map poisoned");
            if let Some(u) = users.get(user_session_id) {
                return Arc::clone(u);
            }
        }
        let mut users = self.users.write().expect("command limiter map poisoned");
        Arc::clone(
            users
                .entry(user_session_id.to_string())
                .or_insert_with(|| {
                    Arc::new(UserBuckets {
                        audio: TokenBucket::new(self.rate_per_sec, self.rate_per_sec.max(1.0)),
                        spectrum: TokenBucket::new(self.rate_per_sec, self.rate_per_sec.max(1.0)),
                    })
                }),
        )
    }

    pub fn allow_audio(&self, user_session_id: &str) -> bool {
        self.user(user_session_id).audio.allow()
    }

    pub fn allow_spectrum(&self, user_session_id: &str) -> bool {
        self.user(user_session_id).spectrum.allow()
    }

    /// Drop a user's buckets when their last session goes away.
    pub fn remove_user(&self, user_session_id: &str) {
        self.users
            .write()
            .expect("command limiter map poisoned")
            .remove(user_session_id);
    }

    pub fn cleanup(&self, idle_window: Duration) -> usize {
        let now = Instant::now();
        let mut users = self.users.write().expect("command limiter map poisoned");
        let before = users.len();
        users.retain(|_, u| {
            u.audio.idle_for(now) < idle_window || u.spectrum.idle_for(now) < idle_window
        });
        before - users.len()
    }

    pub fn stats(&self) -> LimiterStats {
        let n = self.users.read().expect("command limiter map poisoned").len();
        LimiterStats {
            keys: n,
            leaves: n * 2,
        }
    }
}

/// Per-IP-and-subkey limiter where the subkey picks the rate.
pub struct SubkeyLimiter {
    rate_for: fn(&str) -> (f64, f64),
    inner: KeyedLimiter<(IpAddr, String)>,
}

impl SubkeyLimiter {
    pub fn new(rate_for: fn(&str) -> (f64, f64)) -> Self {
        Self {
            rate_for,
            // Per-key rates come from rate_for, so the defaults are unused.
            inner: KeyedLimiter::new(0.0, 0.0),
        }
    }

    pub fn allow(&self, ip: IpAddr, subkey: &str) -> bool {
        self.allow_at(ip, subkey, Instant::now())
    }

    pub fn allow_at(&self, ip: IpAddr, subkey: &str, now: Instant) -> bool {
        let rate_for = self.rate_for;
        self.inner
            .bucket_with(&(ip, subkey.to_string()), |(_, sub)| rate_for(sub))
            .allow_at(now)
    }

    pub fn cleanup(&self, idle_window: Duration) -> usize {
        self.inner.cleanup(idle_window)
    }

    pub fn stats(&self) -> LimiterStats {
        let buckets = self.inner.buckets.read().expect("limiter map poisoned");
        let ips: HashSet<IpAddr> = buckets.keys().map(|(ip, _)| *ip).collect();
        LimiterStats {
            keys: ips.len(),
            leaves: buckets.len(),
        }
    }
}

fn fft_rate(band: &str) -> (f64, f64) {
    // Noise analysis refreshes faster by design of the band scanner.
    if band == "noise-analysis" {
        (2.0, 2.0)
    } else {
        (0.5, 1.0)
    }
}

fn space_weather_rate(endpoint: &str) -> (f64, f64) {
    if endpoint == "current" {
        (1.0, 1.0)
    } else {
        (0.4, 1.0)
    }
}

/// Every limiter the gateway runs, with one sweeper for the lot.
pub struct Limiters {
    /// Tuning commands, per user-session id.
    pub commands: CommandLimiter,
    /// New connections per second, per IP.
    pub connections: KeyedLimiter<IpAddr>,
    /// Session-open requests per minute, per IP.
    pub session_open: KeyedLimiter<IpAddr>,
    /// Aggregate endpoint, one per 5 s per IP.
    pub aggregate: KeyedLimiter<IpAddr>,
    /// FFT endpoint, per IP and band.
    pub fft: SubkeyLimiter,
    /// Space-weather endpoint, per IP and sub-endpoint.
    pub space_weather: SubkeyLimiter,
    /// SSH terminal proxy, 100 per minute per IP.
    pub ssh: KeyedLimiter<IpAddr>,
    /// Session-stats endpoint, one per 3 s per IP.
    pub session_stats: KeyedLimiter<IpAddr>,
}

const SWEEP_SHORT: Duration = Duration::from_secs(5 * 60);
const SWEEP_LONG: Duration = Duration::from_secs(15 * 60);

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            commands: CommandLimiter::new(cfg.command_rate_per_sec),
            connections: KeyedLimiter::new(
                cfg.connection_rate_per_sec,
                cfg.connection_rate_per_sec.max(1.0),
            ),
            session_open: KeyedLimiter::new(
                cfg.session_open_per_min / 60.0,
                cfg.session_open_per_min.max(1.0),
            ),
            aggregate: KeyedLimiter::new(0.2, 1.0),
            fft: SubkeyLimiter::new(fft_rate),
            space_weather: SubkeyLimiter::new(space_weather_rate),
            ssh: KeyedLimiter::new(100.0 / 60.0, 100.0),
            session_stats: KeyedLimiter::new(1.0 / 3.0, 1.0),
        }
    }

    /// Discard idle buckets across all managers.
    pub fn cleanup(&self) {
        self.commands.cleanup(SWEEP_LONG);
        self.connections.cleanup(SWEEP_SHORT);
        self.session_open.cleanup(SWEEP_LONG);
        self.aggregate.cleanup(SWEEP_SHORT);
        self.fft.cleanup(SWEEP_SHORT);
        self.space_weather.cleanup(SWEEP_SHORT);
        self.ssh.cleanup(SWEEP_LONG);
        self.session_stats.cleanup(SWEEP_SHORT);
    }

    pub fn stats(&self) -> LimitersSnapshot {
        let one = |l: &KeyedLimiter<IpAddr>| LimiterStats {
            keys: l.len(),
            leaves: l.len(),
        };
        LimitersSnapshot {
            commands: self.commands.stats(),
            connections: one(&self.connections),
            session_open: one(&self.session_open),
            aggregate: one(&self.aggregate),
            fft: self.fft.stats(),
            space_weather: self.space_weather.stats(),
            ssh: one(&self.ssh),
            session_stats: one(&self.session_stats),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimitersSnapshot {
    pub commands: LimiterStats,
    pub connections: LimiterStats,
    pub session_open: LimiterStats,
    pub aggregate: LimiterStats,
    pub fft: LimiterStats,
    pub space_weather: LimiterStats,
    pub ssh: LimiterStats,
    pub session_stats: LimiterStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_burst_then_refill() {
        let bucket = TokenBucket::new(2.0, 2.0);
        let t0 = Instant::now();
        assert!(bucket.allow_at(t0));
        assert!(bucket.allow_at(t0 + Duration::from_micros(500)));
        assert!(!bucket.allow_at(t0 + Duration::from_millis(1)));
        // Half a second at 2/s refills one token.
        assert!(bucket.allow_at(t0 + Duration::from_millis(501)));
        assert!(!bucket.allow_at(t0 + Duration::from_millis(502)));
    }

    #[test]
    fn test_tokens_cap_at_max() {
        let bucket = TokenBucket::new(1.0, 2.0);
        let t0 = Instant::now();
        // A long idle period must not accumulate more than max tokens.
        let t = t0 + Duration::from_secs(3600);
        assert!(bucket.allow_at(t));
        assert!(bucket.allow_at(t));
        assert!(!bucket.allow_at(t));
    }

    #[test]
    fn test_zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0.0, 0.0);
        let t0 = Instant::now();
        for _ in 0..1000 {
            assert!(bucket.allow_at(t0));
        }
    }

    #[test]
    fn test_keyed_buckets_are_independent() {
        let limiter = KeyedLimiter::new(1.0, 1.0);
        let t0 = Instant::now();
        assert!(limiter.allow_at(&ip("10.0.0.1"), t0));
        assert!(!limiter.allow_at(&ip("10.0.0.1"), t0));
        assert!(limiter.allow_at(&ip("10.0.0.2"), t0));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_cleanup_evicts_idle_buckets() {
        let limiter = KeyedLimiter::new(1.0, 1.0);
        let t0 = Instant::now();
        limiter.allow_at(&ip("10.0.0.1"), t0);
        assert_eq!(limiter.cleanup_at(Duration::from_secs(300), t0 + Duration::from_secs(301)), 1);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_cleanup_keeps_active_buckets() {
        let limiter = KeyedLimiter::new(1.0, 1.0);
        let t0 = Instant::now();
        limiter.allow_at(&ip("10.0.0.1"), t0);
        assert_eq!(limiter.cleanup_at(Duration::from_secs(300), t0 + Duration::from_secs(10)), 0);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_command_limiter_separates_channels() {
        let limiter = CommandLimiter::new(1.0);
        assert!(limiter.allow_audio("user-a"));
        assert!(!limiter.allow_audio("user-a"));
        // The spectrum bucket is untouched by audio commands.
        assert!(limiter.allow_spectrum("user-a"));
        let stats = limiter.stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.leaves, 2);
    }

    #[test]
    fn test_command_limiter_remove_user() {
        let limiter = CommandLimiter::new(1.0);
        limiter.allow_audio("user-a");
        limiter.remove_user("user-a");
        assert_eq!(limiter.stats().keys, 0);
        // A fresh bucket allows again immediately.
        assert!(limiter.allow_audio("user-a"));
    }

    #[test]
    fn test_fft_band_rates_differ() {
        let limiter = SubkeyLimiter::new(fft_rate);
        let t0 = Instant::now();
        let client = ip("10.0.0.1");
        // Normal bands get one token.
        assert!(limiter.allow_at(client, "40m", t0));
        assert!(!limiter.allow_at(client, "40m", t0));
        // Noise analysis holds a burst of two.
        assert!(limiter.allow_at(client, "noise-analysis", t0));
        assert!(limiter.allow_at(client, "noise-analysis", t0));
        assert!(!limiter.allow_at(client, "noise-analysis", t0));
    }

    #[test]
    fn test_subkey_stats_counts_ips_and_leaves() {
        let limiter = SubkeyLimiter::new(fft_rate);
        let t0 = Instant::now();
        limiter.allow_at(ip("10.0.0.1"), "40m", t0);
        limiter.allow_at(ip("10.0.0.1"), "20m", t0);
        limiter.allow_at(ip("10.0.0.2"), "40m", t0);
        let stats = limiter.stats();
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.leaves, 3);
    }

    #[test]
    fn test_space_weather_current_is_faster() {
        let (rate, _) = space_weather_rate("current");
        assert_eq!(rate, 1.0);
        let (rate, _) = space_weather_rate("forecast");
        assert_eq!(rate, 0.4);
    }
}
