//! Round-robin key selection with tiered quota reservation
//!
//! The pool owns an ordered list of API keys and the usage state of each one.
//! A single tokio Mutex guards the usage map and the rotation cursor; it is
//! held for exactly one scan-and-reserve pass and never across a sleep, a
//! snapshot write or an upstream call.
//!
//! Selection is a reservation: the chosen key's counters for the requested
//! tier are incremented before the key is handed out, whether or not the
//! caller's upstream request later succeeds.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use common::ApiKey;
use rand::RngExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::quota::{QuotaLimits, Tier, TierUsage, UsageState};
use crate::snapshot::{SnapshotStore, UsageRecord};

/// Tunables for a pool. Fixed for the pool's lifetime.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub limits: QuotaLimits,
    /// Length of the short rate window.
    pub reset_interval: Duration,
    /// Sleep between full scans that found no eligible key.
    pub backoff: Duration,
    /// Upper bound of a random delay taken before each scan. Zero disables it.
    pub scan_jitter: Duration,
    /// Write the snapshot after every reservation (requires a snapshot store).
    pub persist_on_reserve: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            limits: QuotaLimits::default(),
            reset_interval: Duration::from_secs(60),
            backoff: Duration::from_secs(1),
            scan_jitter: Duration::ZERO,
            persist_on_reserve: false,
        }
    }
}

/// Read-only view of one key's usage, safe to expose (prefix only).
#[derive(Debug, Clone, Serialize)]
pub struct KeyUsage {
    pub key: String,
    pub pro: TierUsage,
    pub flash: TierUsage,
    pub window_age_secs: u64,
}

/// Mutable state behind the pool lock.
struct PoolState {
    usage: Vec<UsageState>,
    cursor: usize,
}

impl PoolState {
    /// One pass over every key starting at the cursor.
    ///
    /// Returns the index of the reserved key. The cursor always ends up one
    /// past the last key examined, so the next pass starts after the winner.
    fn scan(&mut self, tier: Tier, now: Instant, keys: &[ApiKey], settings: &PoolSettings) -> Option<usize> {
        let n = self.usage.len();
        for _ in 0..n {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % n;

            let usage = &mut self.usage[idx];
            if usage.reset_if_due(now, settings.reset_interval) {
                debug!(key = %keys[idx], "rate window reset");
            }
            if usage.is_eligible(tier, &settings.limits) {
                usage.reserve(tier);
                let counts = usage.tier(tier);
                debug!(
                    key = %keys[idx],
                    tier = %tier,
                    short = counts.short,
                    daily = counts.daily,
                    "reserved key"
                );
                return Some(idx);
            }
        }
        None
    }

    fn capture(&self, keys: &[ApiKey], now: Instant) -> HashMap<String, UsageRecord> {
        let wall_now = SystemTime::now();
        keys.iter()
            .zip(&self.usage)
            .map(|(key, usage)| {
                (
                    key.expose().to_string(),
                    UsageRecord::capture(usage, now, wall_now),
                )
            })
            .collect()
    }
}

/// Pool of API keys shared by every in-flight request.
pub struct KeyPool {
    keys: Vec<ApiKey>,
    state: Mutex<PoolState>,
    settings: PoolSettings,
    snapshot: Option<SnapshotStore>,
}

impl KeyPool {
    /// Create a pool over `keys` in the given order.
    ///
    /// Duplicate keys are dropped (first occurrence wins). Every key starts
    /// with zero usage and a rate window opening now.
    pub fn new(keys: Vec<ApiKey>, settings: PoolSettings) -> Result<Self> {
        settings.limits.validate().map_err(Error::InvalidLimits)?;

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            if seen.insert(key.clone()) {
                unique.push(key);
            } else {
                warn!(key = %key, "duplicate API key ignored");
            }
        }
        if unique.is_empty() {
            return Err(Error::NoKeys);
        }

        let now = Instant::now();
        let usage = unique.iter().map(|_| UsageState::new(now)).collect();
        info!(
            keys = unique.len(),
            reset_interval_secs = settings.reset_interval.as_secs(),
            "key pool initialized"
        );
        Ok(Self {
            keys: unique,
            state: Mutex::new(PoolState { usage, cursor: 0 }),
            settings,
            snapshot: None,
        })
    }

    /// Attach a snapshot store used by `restore_snapshot`, `flush` and
    /// persist-on-reserve.
    pub fn with_snapshot(mut self, store: SnapshotStore) -> Self {
        self.snapshot = Some(store);
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Hand out a key within quota for `tier`, waiting as long as it takes.
    ///
    /// Never fails. If every key is over its daily ceiling for `tier` this
    /// never returns; use [`KeyPool::acquire_before`] to bound the wait.
    pub async fn acquire(&self, tier: Tier) -> ApiKey {
        let mut saturated_logged = false;
        loop {
            if let Some(key) = self.try_reserve(tier, None).await {
                return key;
            }
            if !saturated_logged {
                warn!(
                    tier = %tier,
                    keys = self.keys.len(),
                    backoff_ms = self.settings.backoff.as_millis() as u64,
                    "all keys saturated, backing off"
                );
                saturated_logged = true;
            }
            tokio::time::sleep(self.settings.backoff).await;
        }
    }

    /// Like [`KeyPool::acquire`], but gives up once `deadline` has passed.
    ///
    /// At least one scan is always made. Neither scan jitter nor backoff
    /// sleeps overshoot the deadline.
    pub async fn acquire_before(&self, tier: Tier, deadline: Instant) -> Result<ApiKey> {
        let started = Instant::now();
        let mut saturated_logged = false;
        loop {
            if let Some(key) = self.try_reserve(tier, Some(deadline)).await {
                return Ok(key);
            }
            let now = Instant::now();
            if now >= deadline {
                metrics::counter!("key_pool_acquire_timeouts_total", "tier" => tier.as_str())
                    .increment(1);
                warn!(tier = %tier, waited_ms = (now - started).as_millis() as u64, "key acquisition deadline expired");
                return Err(Error::AcquireTimeout {
                    tier,
                    waited: now - started,
                });
            }
            if !saturated_logged {
                warn!(tier = %tier, keys = self.keys.len(), "all keys saturated, waiting for a window reset");
                saturated_logged = true;
            }
            tokio::time::sleep(self.settings.backoff.min(deadline - now)).await;
        }
    }

    /// One jittered scan-and-reserve pass. `None` means every key was saturated.
    async fn try_reserve(&self, tier: Tier, deadline: Option<Instant>) -> Option<ApiKey> {
        self.jitter(deadline).await;

        let (key, records) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let Some(idx) = state.scan(tier, now, &self.keys, &self.settings) else {
                metrics::counter!("key_pool_saturated_scans_total", "tier" => tier.as_str())
                    .increment(1);
                return None;
            };
            let records = (self.settings.persist_on_reserve && self.snapshot.is_some())
                .then(|| state.capture(&self.keys, now));
            (self.keys[idx].clone(), records)
        };

        metrics::counter!("key_pool_reservations_total", "tier" => tier.as_str()).increment(1);

        if let (Some(store), Some(records)) = (&self.snapshot, records) {
            if let Err(e) = store.save(&records).await {
                warn!(error = %e, "failed to persist usage snapshot after reservation");
            }
        }
        Some(key)
    }

    /// Random pre-scan delay, taken before the lock and clipped to `deadline`.
    async fn jitter(&self, deadline: Option<Instant>) {
        let max_ms = self.settings.scan_jitter.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let mut delay = Duration::from_millis(rand::rng().random_range(0..=max_ms));
        if let Some(deadline) = deadline {
            delay = delay.min(deadline.saturating_duration_since(Instant::now()));
        }
        tokio::time::sleep(delay).await;
    }

    /// Snapshot of every key's counters for introspection.
    pub async fn usage_report(&self) -> Vec<KeyUsage> {
        let state = self.state.lock().await;
        let now = Instant::now();
        self.keys
            .iter()
            .zip(&state.usage)
            .map(|(key, usage)| KeyUsage {
                key: key.prefix(),
                pro: usage.pro,
                flash: usage.flash,
                window_age_secs: now.saturating_duration_since(usage.window_start).as_secs(),
            })
            .collect()
    }

    /// Load counters from the attached snapshot store.
    ///
    /// Only keys present in both the pool and the snapshot are touched.
    /// Returns how many keys were restored; zero without a store.
    pub async fn restore_snapshot(&self) -> Result<usize> {
        let Some(store) = &self.snapshot else {
            return Ok(0);
        };
        let records = store.load().await?;

        let mut state = self.state.lock().await;
        let now = Instant::now();
        let wall_now = SystemTime::now();
        let mut restored = 0usize;
        for (key, usage) in self.keys.iter().zip(state.usage.iter_mut()) {
            if let Some(record) = records.get(key.expose()) {
                *usage = record.restore(now, wall_now, self.settings.reset_interval);
                restored += 1;
            }
        }
        info!(restored, ignored = records.len() - restored, "usage restored from snapshot");
        Ok(restored)
    }

    /// Best-effort write of the current usage map. Failures are only logged.
    pub async fn flush(&self) {
        let Some(store) = &self.snapshot else {
            return;
        };
        let records = {
            let state = self.state.lock().await;
            state.capture(&self.keys, Instant::now())
        };
        match store.save(&records).await {
            Ok(()) => debug!(keys = records.len(), "usage snapshot flushed"),
            Err(e) => warn!(error = %e, "failed to flush usage snapshot"),
        }
    }
}
