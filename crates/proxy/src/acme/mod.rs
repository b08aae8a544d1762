//! ACME automatic certificate management
//!
//! Obtains certificates on demand from Let's Encrypt (or any RFC 8555
//! directory) for the whitelisted domains, the first time a TLS client asks
//! for them, and keeps them renewed.
//!
//! # Architecture
//!
//! - [`CertificateManager`] - Whitelist, in-memory cache and per-domain
//!   single-flight issuance; the only thing the TLS acceptor talks to
//! - [`AcmeClient`] - HTTP-01 issuance through `instant-acme`, behind the
//!   [`CertificateIssuer`] trait
//! - [`CertificateStorage`] - Atomic on-disk records and account credentials
//! - [`ChallengeManager`] - Pending HTTP-01 tokens served on port 80
//! - [`RenewalScheduler`] - Background task renewing certificates before
//!   they expire
//!
//! # Challenge Flow
//!
//! When a handshake arrives for a whitelisted domain with no valid
//! certificate:
//!
//! 1. [`CertificateManager`] starts (or joins) the domain's issuance run
//! 2. [`AcmeClient`] creates an order and receives an HTTP-01 token
//! 3. [`ChallengeManager`] registers the token and key authorization
//! 4. The CA requests `/.well-known/acme-challenge/<token>` over plain HTTP
//! 5. The HTTP listener answers with the key authorization
//! 6. Once validated, [`AcmeClient`] finalizes the order with a fresh key
//! 7. [`CertificateStorage`] persists the record, the cache is updated and
//!    every waiting handshake completes with the new certificate

mod challenge;
mod client;
mod error;
mod flight;
pub(crate) mod manager;
pub(crate) mod record;
mod retry;
mod scheduler;
mod storage;

pub use challenge::{strip_port, ChallengeManager, ACME_CHALLENGE_PREFIX};
pub use client::{
    AcmeClient, AcmeClientConfig, CertificateIssuer, ChallengeStatus, PendingChallenge,
};
pub use error::{AcmeError, IssuanceStep, StorageError};
pub use flight::{SharedOutcome, SingleFlight};
pub use manager::{CachedCertificate, CertificateManager, DomainWhitelist};
pub use record::CertificateRecord;
pub use retry::{poll_until, with_retry, Backoff, PollPolicy, PollStatus, RetryPolicy};
pub use scheduler::{RenewalScheduler, RenewalSummary};
pub use storage::CertificateStorage;
