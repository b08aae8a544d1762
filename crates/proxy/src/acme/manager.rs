//! Certificate manager
//!
//! Answers "which certificate do I present for this server name?" on the TLS
//! handshake path. Certificates come from the in-memory cache, then from
//! [`CertificateStorage`], and only then from a fresh issuance run. Runs are
//! single-flight per domain: concurrent handshakes for the same name share
//! one run and one outcome, while other domains proceed independently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use leproxy_config::normalize_domain;

use super::client::CertificateIssuer;
use super::error::{AcmeError, StorageError};
use super::flight::SingleFlight;
use super::record::CertificateRecord;
use super::storage::CertificateStorage;

/// Minimum spacing of handshake-triggered renewals for one domain
const HANDSHAKE_RENEWAL_INTERVAL: StdDuration = StdDuration::from_secs(3600);

/// Host names certificates may be requested for
#[derive(Debug, Clone, Default)]
pub struct DomainWhitelist {
    domains: HashSet<String>,
}

impl DomainWhitelist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| normalize_domain(d.as_ref()))
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Case-insensitive membership test, ignoring a trailing dot
    pub fn contains(&self, name: &str) -> bool {
        self.domains.contains(&normalize_domain(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// A record together with its ready-to-serve signing material
#[derive(Debug)]
pub struct CachedCertificate {
    pub record: CertificateRecord,
    pub certified_key: Arc<CertifiedKey>,
}

impl CachedCertificate {
    pub fn from_record(record: CertificateRecord) -> Result<Self, AcmeError> {
        let certified_key = record.certified_key()?;
        Ok(Self {
            record,
            certified_key,
        })
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.record.not_after
    }
}

/// Everything an issuance run needs, detached from the manager so the run
/// can outlive the caller that started it
#[derive(Clone)]
struct IssueContext {
    cache: Arc<DashMap<String, Arc<CachedCertificate>>>,
    storage: Arc<CertificateStorage>,
    issuer: Arc<dyn CertificateIssuer>,
    renew_before: Duration,
}

impl IssueContext {
    /// Produce a currently valid certificate for `domain`
    ///
    /// Without `force`, a valid certificate already in cache or storage is
    /// returned as is. With `force`, the cache and store are consulted only
    /// for a certificate that is valid and outside the renewal window, which
    /// covers another process having renewed in the meantime.
    async fn resolve(self, domain: String, force: bool) -> Result<Arc<CachedCertificate>, AcmeError> {
        let now = Utc::now();
        let usable = |record: &CertificateRecord| {
            record.is_valid_at(now) && (!force || !record.needs_renewal(now, self.renew_before))
        };

        if let Some(cached) = self.cache.get(&domain).map(|e| Arc::clone(e.value())) {
            if usable(&cached.record) {
                trace!(domain = %domain, "Certificate already cached");
                return Ok(cached);
            }
        }

        let key = domain.clone();
        match self.storage.run_blocking(move |s| s.get(&key)).await {
            Ok(Some(record)) if usable(&record) => {
                debug!(domain = %domain, expires = %record.not_after, "Using stored certificate");
                let cached = Arc::new(CachedCertificate::from_record(record)?);
                self.cache.insert(domain, Arc::clone(&cached));
                return Ok(cached);
            }
            Ok(Some(record)) => {
                debug!(
                    domain = %domain,
                    expires = %record.not_after,
                    "Stored certificate is expired or due for renewal"
                );
            }
            Ok(None) => {}
            Err(StorageError::Serialization(e)) => {
                warn!(domain = %domain, error = %e, "Stored certificate record is corrupt, reissuing");
            }
            Err(e) => return Err(e.into()),
        }

        let started = Instant::now();
        let record = self.issuer.issue(&domain).await?;
        if !record.is_valid_at(Utc::now()) {
            return Err(AcmeError::Certificate(format!(
                "issued certificate for {} is not valid now ({} to {})",
                domain, record.not_before, record.not_after
            )));
        }

        let cached = Arc::new(CachedCertificate::from_record(record)?);
        let (key, stored) = (domain.clone(), cached.record.clone());
        self.storage.run_blocking(move |s| s.put(&key, &stored)).await?;
        self.cache.insert(domain.clone(), Arc::clone(&cached));

        info!(
            domain = %domain,
            expires = %cached.expires(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Certificate issued and cached"
        );
        Ok(cached)
    }
}

/// Certificate manager shared by every handshake
pub struct CertificateManager {
    whitelist: DomainWhitelist,
    ctx: IssueContext,
    flights: SingleFlight<Arc<CachedCertificate>>,
    last_handshake_renewal: DashMap<String, Instant>,
}

impl CertificateManager {
    pub fn new(
        whitelist: DomainWhitelist,
        storage: Arc<CertificateStorage>,
        issuer: Arc<dyn CertificateIssuer>,
        renew_before: StdDuration,
    ) -> Self {
        let renew_before = Duration::from_std(renew_before).unwrap_or(Duration::days(30));
        Self {
            whitelist,
            ctx: IssueContext {
                cache: Arc::new(DashMap::new()),
                storage,
                issuer,
                renew_before,
            },
            flights: SingleFlight::new(),
            last_handshake_renewal: DashMap::new(),
        }
    }

    pub fn whitelist(&self) -> &DomainWhitelist {
        &self.whitelist
    }

    pub fn renew_before(&self) -> Duration {
        self.ctx.renew_before
    }

    /// Certificate to present for `server_name`
    ///
    /// Names outside the whitelist fail immediately without touching the
    /// network. A valid cached certificate is returned at once; when it is
    /// inside the renewal window a background renewal is started through
    /// the domain's slot. Without a valid certificate the caller waits for
    /// the domain's issuance run.
    pub async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        let domain = normalize_domain(server_name);
        if domain.is_empty() {
            return Err(AcmeError::MissingServerName);
        }
        if !self.whitelist.contains(&domain) {
            debug!(domain = %domain, "Rejecting certificate request for unlisted domain");
            return Err(AcmeError::UnauthorizedDomain(domain));
        }

        let now = Utc::now();
        if let Some(cached) = self.cached(&domain) {
            if cached.record.is_valid_at(now) {
                if cached.record.needs_renewal(now, self.ctx.renew_before) {
                    self.renew_in_background(&domain);
                }
                trace!(domain = %domain, "Serving cached certificate");
                return Ok(Arc::clone(&cached.certified_key));
            }
        }

        let (outcome, leader) = self.flights.join(&domain, || {
            self.ctx.clone().resolve(domain.clone(), false)
        });
        if !leader {
            debug!(domain = %domain, "Waiting for in-flight issuance");
        }
        let cached = outcome.await?;

        let now = Utc::now();
        if !cached.record.is_valid_at(now) {
            return Err(AcmeError::Certificate(format!(
                "certificate for {} is outside its validity window",
                domain
            )));
        }
        if cached.record.needs_renewal(now, self.ctx.renew_before) {
            self.renew_in_background(&domain);
        }
        Ok(Arc::clone(&cached.certified_key))
    }

    /// Issue a replacement certificate for `domain` and wait for it
    ///
    /// Shares the domain's slot with handshakes, so a renewal and a
    /// handshake-triggered issuance never run side by side.
    pub async fn renew(&self, domain: &str) -> Result<Arc<CachedCertificate>, AcmeError> {
        let domain = normalize_domain(domain);
        if !self.whitelist.contains(&domain) {
            return Err(AcmeError::UnauthorizedDomain(domain));
        }
        let (outcome, _) = self
            .flights
            .join(&domain, || self.ctx.clone().resolve(domain.clone(), true));
        outcome.await
    }

    fn renew_in_background(&self, domain: &str) {
        if self.flights.in_flight(domain) {
            return;
        }
        if let Some(last) = self.last_handshake_renewal.get(domain) {
            if last.elapsed() < HANDSHAKE_RENEWAL_INTERVAL {
                return;
            }
        }
        self.last_handshake_renewal
            .insert(domain.to_string(), Instant::now());

        let (outcome, leader) = self
            .flights
            .join(domain, || self.ctx.clone().resolve(domain.to_string(), true));
        if !leader {
            return;
        }

        info!(domain = %domain, "Certificate due for renewal, renewing in background");
        let domain = domain.to_string();
        tokio::spawn(async move {
            match outcome.await {
                Ok(cached) => {
                    info!(domain = %domain, expires = %cached.expires(), "Background renewal complete")
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Background renewal failed, keeping current certificate")
                }
            }
        });
    }

    /// Load every whitelisted domain's stored, valid certificate into the
    /// cache
    ///
    /// Returns the number of certificates loaded. Unreadable records are
    /// skipped with a warning.
    pub fn warm_from_store(&self) -> usize {
        let now = Utc::now();
        let mut loaded = 0;

        for domain in self.whitelist.iter() {
            let record = match self.ctx.storage.get(domain) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping unreadable stored certificate");
                    continue;
                }
            };
            if !record.is_valid_at(now) {
                debug!(domain = %domain, expires = %record.not_after, "Stored certificate expired");
                continue;
            }
            match CachedCertificate::from_record(record) {
                Ok(cached) => {
                    self.ctx.cache.insert(domain.to_string(), Arc::new(cached));
                    loaded += 1;
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping unusable stored certificate");
                }
            }
        }

        info!(loaded = loaded, domains = self.whitelist.len(), "Loaded stored certificates");
        loaded
    }

    /// Domains holding a certificate (cached or stored) that is due for
    /// renewal at `now`
    pub fn renewal_candidates(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut candidates = Vec::new();

        for domain in self.whitelist.iter() {
            let due = match self.cached(domain) {
                Some(cached) => Some(cached.record.needs_renewal(now, self.ctx.renew_before)),
                None => match self.ctx.storage.get(domain) {
                    Ok(record) => record.map(|r| r.needs_renewal(now, self.ctx.renew_before)),
                    Err(e) => {
                        warn!(domain = %domain, error = %e, "Cannot read stored certificate");
                        None
                    }
                },
            };

            if due == Some(true) {
                candidates.push(domain.to_string());
            }
        }

        candidates.sort();
        candidates
    }

    fn cached(&self, domain: &str) -> Option<Arc<CachedCertificate>> {
        self.ctx.cache.get(domain).map(|e| Arc::clone(e.value()))
    }

    /// Cached record for `domain`, if any
    pub fn cached_record(&self, domain: &str) -> Option<CertificateRecord> {
        self.cached(&normalize_domain(domain))
            .map(|cached| cached.record.clone())
    }

    pub fn cached_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.ctx.cache.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    /// Drop `domain` from the in-memory cache
    pub fn invalidate(&self, domain: &str) {
        let domain = normalize_domain(domain);
        if self.ctx.cache.remove(&domain).is_some() {
            debug!(domain = %domain, "Invalidated cached certificate");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Abort in-flight issuance runs
    pub fn shutdown(&self) {
        self.flights.abort_all();
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("domains", &self.whitelist.len())
            .field("cached", &self.ctx.cache.len())
            .field("in_flight", &self.flights.len())
            .field("renew_before", &self.ctx.renew_before)
            .finish()
    }
}
