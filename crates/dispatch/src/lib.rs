//! Retry/fallback dispatch of a prompt across the key pool
//!
//! A `Dispatcher` walks a fixed `RetryLadder` of `(tier, model, temperature)`
//! attempts. Each attempt reserves a key from the shared `KeyPool` for the
//! attempt's tier, calls the completion backend once, and either returns the
//! text or backs off before the next rung. The pool lock is never held while
//! an upstream call is in flight.

pub mod dispatcher;
pub mod error;
pub mod ladder;

pub use dispatcher::{DispatchSettings, Dispatcher};
pub use error::{DispatchError, LadderError};
pub use ladder::{AttemptSpec, RetryLadder};
