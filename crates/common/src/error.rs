//! Configuration error types

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_carries_detail() {
        let err = Error::Config("no API keys configured".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: no API keys configured"
        );
    }

    #[test]
    fn io_error_converts_with_prefix() {
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "keys file missing").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
        assert!(format!("{err:?}").contains("Io"));
    }
}
