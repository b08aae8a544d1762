//! Configuration error types.

use thiserror::Error;

/// Errors that prevent the proxy from starting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one domain is required")]
    EmptyDomainList,

    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("invalid target URL '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("unsupported target scheme '{0}' (expected http or https)")]
    UnsupportedTargetScheme(String),

    #[error("health check path must start with '/': {0}")]
    InvalidHealthPath(String),

    #[error("invalid ACME directory URL {0}")]
    InvalidDirectoryUrl(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
