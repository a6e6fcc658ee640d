//! Shared types for the Gemini relay workspace
//!
//! Holds the secret wrappers used for upstream API keys and the configuration
//! error type shared by the service and its libraries.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{ApiKey, KEY_PREFIX_LEN, Secret, parse_key_list};
