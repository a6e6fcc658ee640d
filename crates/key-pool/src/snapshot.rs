//! Best-effort persistence of key usage counters
//!
//! The snapshot is a JSON object keyed by the full API key (needed to match
//! entries back to pool keys on restart), with per-tier counters and the wall
//! clock time of the last window reset in unix seconds. All writes use atomic
//! temp-file + rename and a tokio Mutex serializes concurrent writers.
//!
//! Persistence is never required for correctness: the pool works from memory
//! and only reads the snapshot once at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::quota::{TierUsage, UsageState};

/// Persisted counters for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub pro_count: u32,
    pub pro_daily: u32,
    pub flash_count: u32,
    pub flash_daily: u32,
    /// Unix timestamp (seconds) at which the current rate window started.
    pub last_reset: f64,
}

impl UsageRecord {
    /// Capture a usage state, translating its monotonic window start to wall time.
    pub fn capture(state: &UsageState, now: Instant, wall_now: SystemTime) -> Self {
        let window_age = now.saturating_duration_since(state.window_start);
        Self {
            pro_count: state.pro.short,
            pro_daily: state.pro.daily,
            flash_count: state.flash.short,
            flash_daily: state.flash.daily,
            last_reset: unix_secs(wall_now) - window_age.as_secs_f64(),
        }
    }

    /// Rebuild a usage state relative to `now`.
    ///
    /// A window that would already have expired is reset on the spot; a
    /// timestamp in the future counts as a window that just started.
    pub fn restore(&self, now: Instant, wall_now: SystemTime, reset_interval: Duration) -> UsageState {
        let age_secs = unix_secs(wall_now) - self.last_reset;
        let age = if age_secs.is_finite() && age_secs > 0.0 {
            Duration::try_from_secs_f64(age_secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };

        let mut state = UsageState {
            pro: TierUsage {
                short: self.pro_count,
                daily: self.pro_daily,
            },
            flash: TierUsage {
                short: self.flash_count,
                daily: self.flash_daily,
            },
            window_start: now.checked_sub(age).unwrap_or(now),
        };
        if age >= reset_interval {
            state.reset_if_due(now, Duration::ZERO);
        }
        state
    }
}

fn unix_secs(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// JSON snapshot file of the pool's usage map.
pub struct SnapshotStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is an empty snapshot.
    pub async fn load(&self) -> Result<HashMap<String, UsageRecord>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            info!(path = %self.path.display(), "usage snapshot not found, starting fresh");
            return Ok(HashMap::new());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading usage snapshot: {e}")))?;
        let records: HashMap<String, UsageRecord> = serde_json::from_str(&contents)
            .map_err(|e| Error::SnapshotParse(format!("parsing usage snapshot: {e}")))?;
        info!(path = %self.path.display(), keys = records.len(), "loaded usage snapshot");
        Ok(records)
    }

    /// Persist a full snapshot, replacing the previous file.
    pub async fn save(&self, records: &HashMap<String, UsageRecord>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, records).await
    }
}

/// Write the snapshot atomically via a temp file in the same directory.
///
/// The file holds full API keys, so it is restricted to 0600 on unix.
async fn write_atomic(path: &Path, data: &HashMap<String, UsageRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::SnapshotParse(format!("serializing usage snapshot: {e}")))?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".usage.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp snapshot file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting snapshot file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp snapshot file: {e}")))?;

    debug!(path = %path.display(), keys = data.len(), "persisted usage snapshot");
    Ok(())
}
