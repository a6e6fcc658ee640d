//! Tiers, quota ceilings and per-key usage counters
//!
//! Every key carries two counters per tier: a short-window count that resets
//! when the key's rate window rolls over, and a daily count that only ever
//! grows for the lifetime of the process. A key is eligible for a tier while
//! both counters are below that tier's ceilings.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Quality/cost class of a completion request, with independent quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Pro,
    Flash,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Pro, Tier::Flash];

    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Pro => "pro",
            Tier::Flash => "flash",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ceilings for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Uses allowed within one rate window.
    pub short: u32,
    /// Uses allowed for the lifetime of the process.
    pub daily: u32,
}

/// Ceilings for every tier. Tiers left out when deserializing keep their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub pro: TierLimits,
    pub flash: TierLimits,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            pro: TierLimits { short: 2, daily: 50 },
            flash: TierLimits {
                short: 15,
                daily: 1500,
            },
        }
    }
}

impl QuotaLimits {
    pub fn for_tier(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Pro => self.pro,
            Tier::Flash => self.flash,
        }
    }

    /// Reject ceilings of zero, which would make a tier permanently unservable.
    pub fn validate(&self) -> Result<(), String> {
        for tier in Tier::ALL {
            let limits = self.for_tier(tier);
            if limits.short == 0 || limits.daily == 0 {
                return Err(format!(
                    "{tier} limits must be at least 1 (short={}, daily={})",
                    limits.short, limits.daily
                ));
            }
        }
        Ok(())
    }
}

/// Counters for one key and one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub short: u32,
    pub daily: u32,
}

impl TierUsage {
    fn is_within(&self, limits: TierLimits) -> bool {
        self.short < limits.short && self.daily < limits.daily
    }
}

/// Usage state of a single key.
#[derive(Debug, Clone)]
pub struct UsageState {
    pub pro: TierUsage,
    pub flash: TierUsage,
    pub window_start: Instant,
}

impl UsageState {
    pub fn new(now: Instant) -> Self {
        Self {
            pro: TierUsage::default(),
            flash: TierUsage::default(),
            window_start: now,
        }
    }

    pub fn tier(&self, tier: Tier) -> &TierUsage {
        match tier {
            Tier::Pro => &self.pro,
            Tier::Flash => &self.flash,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierUsage {
        match tier {
            Tier::Pro => &mut self.pro,
            Tier::Flash => &mut self.flash,
        }
    }

    /// Zero both short-window counters if the window has elapsed.
    ///
    /// Returns true when a reset happened. Daily counters are untouched.
    pub fn reset_if_due(&mut self, now: Instant, interval: Duration) -> bool {
        if now.saturating_duration_since(self.window_start) < interval {
            return false;
        }
        self.pro.short = 0;
        self.flash.short = 0;
        self.window_start = now;
        true
    }

    pub fn is_eligible(&self, tier: Tier, limits: &QuotaLimits) -> bool {
        self.tier(tier).is_within(limits.for_tier(tier))
    }

    /// Record one use of `tier` in both dimensions.
    pub fn reserve(&mut self, tier: Tier) {
        let usage = self.tier_mut(tier);
        usage.short = usage.short.saturating_add(1);
        usage.daily = usage.daily.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_free_tier_quotas() {
        let limits = QuotaLimits::default();
        assert_eq!(limits.for_tier(Tier::Pro), TierLimits { short: 2, daily: 50 });
        assert_eq!(
            limits.for_tier(Tier::Flash),
            TierLimits {
                short: 15,
                daily: 1500
            }
        );
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn zero_ceiling_fails_validation() {
        let mut limits = QuotaLimits::default();
        limits.flash.daily = 0;
        let err = limits.validate().unwrap_err();
        assert!(err.contains("flash"), "got: {err}");
    }

    #[test]
    fn tier_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Pro).unwrap(), "\"pro\"");
        let tier: Tier = serde_json::from_str("\"flash\"").unwrap();
        assert_eq!(tier, Tier::Flash);
    }

    #[test]
    fn reserve_increments_both_dimensions_of_one_tier() {
        let mut usage = UsageState::new(Instant::now());
        usage.reserve(Tier::Pro);
        usage.reserve(Tier::Pro);
        assert_eq!(usage.pro, TierUsage { short: 2, daily: 2 });
        assert_eq!(usage.flash, TierUsage::default());
    }

    #[test]
    fn eligibility_requires_both_ceilings() {
        let limits = QuotaLimits::default();
        let mut usage = UsageState::new(Instant::now());
        usage.pro = TierUsage { short: 1, daily: 49 };
        assert!(usage.is_eligible(Tier::Pro, &limits));

        usage.pro = TierUsage { short: 2, daily: 10 };
        assert!(!usage.is_eligible(Tier::Pro, &limits));

        usage.pro = TierUsage { short: 0, daily: 50 };
        assert!(!usage.is_eligible(Tier::Pro, &limits));
        assert!(usage.is_eligible(Tier::Flash, &limits));
    }

    #[tokio::test(start_paused = true)]
    async fn window_reset_clears_short_counters_only() {
        let interval = Duration::from_secs(60);
        let mut usage = UsageState::new(Instant::now());
        usage.pro = TierUsage { short: 2, daily: 7 };
        usage.flash = TierUsage { short: 15, daily: 30 };

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!usage.reset_if_due(Instant::now(), interval));
        assert_eq!(usage.pro.short, 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        assert!(usage.reset_if_due(now, interval));
        assert_eq!(usage.pro, TierUsage { short: 0, daily: 7 });
        assert_eq!(usage.flash, TierUsage { short: 0, daily: 30 });
        assert_eq!(usage.window_start, now);
    }
}
