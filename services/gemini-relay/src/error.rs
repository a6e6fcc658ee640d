//! Service-specific error types

use thiserror::Error;

/// Relay startup errors.
///
/// Per-request failures (missing prompt, exhausted attempts, acquire
/// timeouts) are turned into HTTP responses by the `/generate` handler and
/// never propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to build key pool: {0}")]
    Pool(#[from] key_pool::Error),

    #[error("invalid retry ladder: {0}")]
    Ladder(#[from] dispatch::LadderError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
