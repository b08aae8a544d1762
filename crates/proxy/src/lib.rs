//! leproxy library
//!
//! A TLS-terminating reverse proxy that obtains and renews its certificates
//! from an ACME certificate authority (Let's Encrypt by default).
//!
//! - **Certificates**: on-demand issuance at handshake time, durable cache,
//!   background renewal, at most one issuance per domain in flight
//! - **HTTP-01**: challenge responses on the plain HTTP listener
//! - **Proxying**: every request forwarded to one backend URL
//! - **Shutdown**: graceful drain on SIGINT/SIGTERM
//!
//! # Example
//!
//! ```no_run
//! use leproxy::ProxyContext;
//! use leproxy_config::ProxyConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut config = ProxyConfig::new(
//!     vec!["example.com".to_string()],
//!     "http://127.0.0.1:8080",
//! )?;
//! config.validate()?;
//!
//! let ctx = ProxyContext::new(config)?;
//! ctx.run().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod builtin_handlers;
pub mod http_listener;
pub mod proxy;
pub mod shutdown;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Application wiring
pub use app::{BoundProxy, ProxyContext};

// Certificate management
pub use acme::{
    AcmeClient, AcmeError, CertificateIssuer, CertificateManager, CertificateRecord,
    CertificateStorage, ChallengeManager, DomainWhitelist, RenewalScheduler, StorageError,
};

// Request handling
pub use builtin_handlers::PlainHttpPolicy;
pub use proxy::{ProxyBody, ReverseProxy};
pub use tls::{AcceptError, TlsAcceptor};

// Shutdown
pub use shutdown::ConnectionDrain;
