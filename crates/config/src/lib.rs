//! Configuration for the leproxy ACME reverse proxy
//!
//! A [`ProxyConfig`] is assembled by the binary from command-line flags and
//! environment variables, then checked with [`ProxyConfig::validate`] before
//! anything binds a socket or touches the certificate cache. A config that
//! fails validation must never be served.
//!
//! # Example
//!
//! ```
//! use leproxy_config::ProxyConfig;
//!
//! let mut config = ProxyConfig::new(
//!     vec!["Example.COM.".to_string()],
//!     "http://127.0.0.1:8080",
//! )
//! .unwrap();
//! config.validate().unwrap();
//! assert_eq!(config.domains, vec!["example.com".to_string()]);
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

mod error;
pub mod validate;

pub use error::ConfigError;

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Upper bound of the renewal window, in days
pub const MAX_RENEW_BEFORE_DAYS: u32 = 365;

// ============================================================================
// Top-level configuration
// ============================================================================

/// Complete proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Host names certificates may be requested for (the whitelist)
    pub domains: Vec<String>,
    /// Backend every request is forwarded to
    pub target: Url,
    /// TLS listener address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Plain HTTP listener (challenges and redirect)
    #[serde(default)]
    pub http: HttpConfig,
    /// Health check surfaces
    #[serde(default)]
    pub health: HealthConfig,
    /// ACME issuance settings
    #[serde(default)]
    pub acme: AcmeConfig,
    /// Process-level settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Plain HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listener address; `None` disables the listener entirely, which also
    /// disables HTTP-01 validation
    #[serde(default = "default_http_listen")]
    pub listen: Option<SocketAddr>,
    /// Answer non-challenge requests with a permanent redirect to HTTPS
    #[serde(default = "default_true")]
    pub redirect: bool,
}

/// Health check configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Path answered with `200 OK` on the HTTP and HTTPS listeners
    #[serde(default)]
    pub path: Option<String>,
    /// Dedicated listener answering `OK` on every path
    #[serde(default)]
    pub address: Option<SocketAddr>,
}

/// ACME issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// ACME directory URL
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    /// Contact e-mail registered with the account
    #[serde(default)]
    pub email: Option<String>,
    /// Certificate and account storage directory
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Renew certificates this many days before they expire
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
    /// Interval between background renewal scans
    #[serde(default = "default_renewal_check_interval_secs")]
    pub renewal_check_interval_secs: u64,
    /// Hard deadline of a single ACME request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retries of a single ACME request on transient failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Total deadline for challenge validation and order processing
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
}

/// Process-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Grace period for in-flight requests on shutdown
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_secs: u64,
}

// ============================================================================
// Defaults
// ============================================================================

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_http_listen() -> Option<SocketAddr> {
    Some(SocketAddr::from(([0, 0, 0, 0], 80)))
}

fn default_true() -> bool {
    true
}

fn default_directory_url() -> String {
    LETSENCRYPT_PRODUCTION.to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/certs")
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_renewal_check_interval_secs() -> u64 {
    12 * 3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_validation_timeout_secs() -> u64 {
    120
}

fn default_graceful_shutdown_timeout() -> u64 {
    10
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            redirect: true,
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            email: None,
            cache_dir: default_cache_dir(),
            renew_before_days: default_renew_before_days(),
            renewal_check_interval_secs: default_renewal_check_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            validation_timeout_secs: default_validation_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
        }
    }
}

// ============================================================================
// Construction and validation
// ============================================================================

impl ProxyConfig {
    /// Build a configuration with defaults for everything but the whitelist
    /// and the backend target
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTarget`] if `target` does not parse as
    /// a URL.
    pub fn new(domains: Vec<String>, target: &str) -> Result<Self, ConfigError> {
        let target = parse_target(target)?;
        Ok(Self {
            domains,
            target,
            listen: default_listen(),
            http: HttpConfig::default(),
            health: HealthConfig::default(),
            acme: AcmeConfig::default(),
            server: ServerConfig::default(),
        })
    }

    /// Validate and normalize the configuration in place
    ///
    /// Domains are lower-cased, stripped of a trailing dot and deduplicated.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        trace!(domain_count = self.domains.len(), "Validating proxy configuration");

        if self.domains.is_empty() {
            return Err(ConfigError::EmptyDomainList);
        }

        let mut normalized: Vec<String> = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let domain = validate_domain(domain)?;
            if !normalized.contains(&domain) {
                normalized.push(domain);
            }
        }
        self.domains = normalized;

        match self.target.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedTargetScheme(other.to_string())),
        }
        if self.target.host_str().is_none() {
            return Err(ConfigError::InvalidTarget {
                url: self.target.to_string(),
                reason: "missing host".to_string(),
            });
        }

        if let Some(ref path) = self.health.path {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidHealthPath(path.clone()));
            }
        }

        let directory = Url::parse(&self.acme.directory_url)
            .map_err(|e| ConfigError::InvalidDirectoryUrl(format!("{}: {}", self.acme.directory_url, e)))?;
        if directory.scheme() != "https" && !is_loopback_host(&directory) {
            return Err(ConfigError::InvalidDirectoryUrl(format!(
                "{}: directory must be served over https",
                self.acme.directory_url
            )));
        }

        if self.acme.renew_before_days == 0 {
            return Err(ConfigError::InvalidValue {
                field: "renew_before_days",
                reason: "must be at least one day".to_string(),
            });
        }
        if self.acme.renew_before_days > MAX_RENEW_BEFORE_DAYS {
            return Err(ConfigError::InvalidValue {
                field: "renew_before_days",
                reason: format!("must be at most {} days", MAX_RENEW_BEFORE_DAYS),
            });
        }
        if self.acme.request_timeout_secs == 0 || self.acme.validation_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeouts",
                reason: "ACME timeouts must be non-zero".to_string(),
            });
        }

        debug!(
            domains = ?self.domains,
            target = %self.target,
            listen = %self.listen,
            "Proxy configuration validated"
        );
        Ok(())
    }

    /// Renewal window as a duration
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(u64::from(self.acme.renew_before_days) * 86_400)
    }

    /// Grace period for in-flight requests on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.graceful_shutdown_timeout_secs)
    }
}

/// Parse the backend target URL
pub fn parse_target(target: &str) -> Result<Url, ConfigError> {
    Url::parse(target).map_err(|e| ConfigError::InvalidTarget {
        url: target.to_string(),
        reason: e.to_string(),
    })
}

/// Normalize a host name for whitelist comparison
///
/// ASCII lower-case, trailing dots removed.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Validate a whitelisted domain and return its normalized form
fn validate_domain(domain: &str) -> Result<String, ConfigError> {
    let normalized = normalize_domain(domain);
    let invalid = |reason: &str| ConfigError::InvalidDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };

    if normalized.is_empty() {
        return Err(invalid("empty name"));
    }
    if normalized.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }
    if normalized.contains('*') {
        return Err(invalid("wildcard certificates are not supported"));
    }
    if normalized.parse::<std::net::IpAddr>().is_ok() {
        return Err(invalid("IP addresses cannot be validated over HTTP-01"));
    }
    for label in normalized.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("label must be 1 to 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label may not start or end with '-'"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("only letters, digits and '-' are allowed"));
        }
    }
    Ok(normalized)
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}
