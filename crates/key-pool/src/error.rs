//! Error types for pool operations

use std::time::Duration;

use crate::quota::Tier;

/// Errors from pool operations.
///
/// `acquire` itself never fails; these cover construction, deadline-bounded
/// acquisition and snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool requires at least one API key")]
    NoKeys,

    #[error("invalid quota limits: {0}")]
    InvalidLimits(String),

    #[error("no {tier} key became available within {}ms", waited.as_millis())]
    AcquireTimeout { tier: Tier, waited: Duration },

    #[error("snapshot I/O error: {0}")]
    Io(String),

    #[error("snapshot parse error: {0}")]
    SnapshotParse(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
