//! Issued certificate records
//!
//! A [`CertificateRecord`] is the unit persisted by
//! [`CertificateStorage`](super::CertificateStorage): the PEM chain, the PEM
//! private key and the validity window of the leaf certificate. The window is
//! always read from the certificate itself so that a record can never claim a
//! validity its chain does not have.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};

use super::error::AcmeError;

/// A certificate chain with its private key and validity window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Domain the certificate was issued for
    pub domain: String,
    /// PEM-encoded certificate chain, leaf first
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// Start of the leaf's validity
    pub not_before: DateTime<Utc>,
    /// End of the leaf's validity
    pub not_after: DateTime<Utc>,
    /// When the certificate was obtained
    pub issued: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a record from a PEM chain and key, reading the validity window
    /// from the leaf certificate
    ///
    /// # Errors
    ///
    /// Returns [`AcmeError::Certificate`] if the chain is empty or the leaf
    /// cannot be parsed.
    pub fn from_pem(
        domain: &str,
        cert_pem: String,
        key_pem: String,
        issued: DateTime<Utc>,
    ) -> Result<Self, AcmeError> {
        let chain = parse_chain(&cert_pem)?;
        let (not_before, not_after) = leaf_validity(&chain[0])?;

        Ok(Self {
            domain: domain.to_string(),
            cert_pem,
            key_pem,
            not_before,
            not_after,
            issued,
        })
    }

    /// Whether `now` lies inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether the certificate expires within `window` of `now`
    ///
    /// A window reaching past the start of representable time always
    /// counts as due.
    pub fn needs_renewal(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.not_after
            .checked_sub_signed(window)
            .map_or(true, |renew_at| renew_at <= now)
    }

    /// Build the signing material handed to rustls
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, AcmeError> {
        let chain = parse_chain(&self.cert_pem)?;
        let key = parse_private_key(&self.key_pem)?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
            .map_err(|e| AcmeError::Certificate(format!("unsupported private key: {}", e)))?;
        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

fn parse_chain(cert_pem: &str) -> Result<Vec<CertificateDer<'static>>, AcmeError> {
    let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AcmeError::Certificate(format!("invalid certificate PEM: {}", e)))?;
    if chain.is_empty() {
        return Err(AcmeError::Certificate(
            "certificate PEM contains no certificates".to_string(),
        ));
    }
    Ok(chain)
}

fn parse_private_key(key_pem: &str) -> Result<PrivateKeyDer<'static>, AcmeError> {
    rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| AcmeError::Certificate(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| AcmeError::Certificate("private key PEM contains no key".to_string()))
}

fn leaf_validity(
    leaf: &CertificateDer<'_>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), AcmeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| AcmeError::Certificate(format!("invalid X509 certificate: {}", e)))?;
    let validity = cert.validity();

    let to_utc = |timestamp: i64| {
        DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
            AcmeError::Certificate(format!("validity timestamp out of range: {}", timestamp))
        })
    };

    Ok((
        to_utc(validity.not_before.timestamp())?,
        to_utc(validity.not_after.timestamp())?,
    ))
}
