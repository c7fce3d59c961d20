//! Error types for the firewall helper.

use std::io;

use thiserror::Error;

use crate::blocklist::StoreError;

/// Main error type for helper operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("blocklist error: {0}")]
    Store(#[from] StoreError),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("listen_addr must be a loopback address, got {0}")]
    NonLoopbackListener(std::net::SocketAddr),

    #[error("max_field_len must be greater than 0")]
    ZeroFieldLength,

    #[error("timeouts.{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("dns.{0} must be greater than 0")]
    ZeroRetryCount(&'static str),

    #[error("{0} cannot be empty")]
    EmptySetting(&'static str),

    #[error("install.bundle_name must be a single path component: {0:?}")]
    InvalidBundleName(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
