//! Error types for dispatching and ladder construction

use std::time::Duration;

use key_pool::Tier;

/// Terminal failure of [`crate::Dispatcher::respond`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Every rung of the ladder failed; `detail` is the last failure.
    #[error("Error after {attempts} attempts: {detail}")]
    AttemptsExhausted { attempts: usize, detail: String },

    /// No key for an attempt's tier became available before the acquire deadline.
    #[error("no {tier} key became available within {}ms", waited.as_millis())]
    AcquireTimeout { tier: Tier, waited: Duration },

    /// Any other key pool failure during acquisition.
    #[error(transparent)]
    Pool(key_pool::Error),
}

impl From<key_pool::Error> for DispatchError {
    fn from(e: key_pool::Error) -> Self {
        match e {
            key_pool::Error::AcquireTimeout { tier, waited } => Self::AcquireTimeout { tier, waited },
            other => Self::Pool(other),
        }
    }
}

/// Rejected retry ladder.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LadderError {
    #[error("retry ladder must have at least one attempt")]
    Empty,

    #[error("attempt {index}: model name must not be empty")]
    BlankModel { index: usize },

    #[error("attempt {index}: temperature {value} must be within 0.0..=2.0")]
    Temperature { index: usize, value: f32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_keeps_tier_and_wait() {
        let err = DispatchError::from(key_pool::Error::AcquireTimeout {
            tier: Tier::Flash,
            waited: Duration::from_millis(250),
        });
        assert!(matches!(
            err,
            DispatchError::AcquireTimeout { tier: Tier::Flash, waited } if waited == Duration::from_millis(250)
        ));
        assert_eq!(err.to_string(), "no flash key became available within 250ms");
    }

    #[test]
    fn other_pool_errors_are_not_timeouts() {
        let err = DispatchError::from(key_pool::Error::Io("disk full".into()));
        assert!(matches!(err, DispatchError::Pool(key_pool::Error::Io(_))), "got: {err}");
        assert_eq!(err.to_string(), "snapshot I/O error: disk full");

        let err = DispatchError::from(key_pool::Error::NoKeys);
        assert!(matches!(err, DispatchError::Pool(key_pool::Error::NoKeys)));
    }
}
