//! API key pool with tiered rate limiting
//!
//! Hands out upstream API keys round-robin while keeping every key inside its
//! per-tier quotas: a short rolling window (reset every `reset_interval`) and a
//! process-lifetime "daily" ceiling.
//!
//! Request lifecycle:
//! 1. Caller asks for a key for a tier (`pro` or `flash`)
//! 2. Pool scans keys from the rotation cursor, resetting expired windows
//! 3. First key under both ceilings is reserved (counters incremented) and returned
//! 4. If every key is saturated the caller backs off outside the lock and rescans
//! 5. Optionally, counters are snapshotted to disk and restored on the next start

pub mod error;
pub mod pool;
pub mod quota;
pub mod snapshot;

pub use error::{Error, Result};
pub use pool::{KeyPool, KeyUsage, PoolSettings};
pub use quota::{QuotaLimits, Tier, TierLimits, TierUsage, UsageState};
pub use snapshot::{SnapshotStore, UsageRecord};
