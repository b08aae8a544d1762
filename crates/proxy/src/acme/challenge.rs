//! HTTP-01 ACME challenge management
//!
//! Manages pending ACME HTTP-01 challenges for serving via
//! `/.well-known/acme-challenge/<token>` on the plain HTTP listener.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use leproxy_config::normalize_domain;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone)]
struct PendingToken {
    domain: String,
    key_authorization: String,
}

/// Manages pending ACME HTTP-01 challenges
///
/// While an order is being validated the certificate authority requests
/// `http://<domain>/.well-known/acme-challenge/<token>`. This manager holds
/// the token -> key authorization mapping for every order in flight so that
/// the HTTP listener can answer. Tokens are scoped to the domain they were
/// issued for.
///
/// Cloning is cheap and every clone shares the same table.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    /// Map of challenge token -> pending response
    challenges: Arc<DashMap<String, PendingToken>>,
}

impl ChallengeManager {
    /// Create a new challenge manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge for `domain`
    pub fn register(&self, domain: &str, token: &str, key_authorization: &str) {
        debug!(domain = %domain, token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges.insert(
            token.to_string(),
            PendingToken {
                domain: normalize_domain(domain),
                key_authorization: key_authorization.to_string(),
            },
        );
    }

    /// Remove every token registered for `domain`
    ///
    /// Called once an issuance run ends, whatever its outcome.
    pub fn unregister(&self, domain: &str) {
        let domain = normalize_domain(domain);
        let before = self.challenges.len();
        self.challenges.retain(|_, pending| pending.domain != domain);
        let removed = before.saturating_sub(self.challenges.len());
        if removed > 0 {
            debug!(domain = %domain, removed = removed, "Removed ACME challenges for domain");
        }
    }

    /// Answer a challenge request
    ///
    /// Returns the key authorization when `path` is a challenge path whose
    /// token is pending and, if the request named a host, that host is the
    /// domain the token was issued for. Any port on `host` is ignored.
    pub fn respond(&self, host: Option<&str>, path: &str) -> Option<String> {
        let token = Self::extract_token(path)?;
        if token.is_empty() {
            return None;
        }

        let pending = self.challenges.get(token)?;
        if let Some(host) = host {
            let host = normalize_domain(strip_port(host));
            if host != pending.domain {
                debug!(
                    token = %token,
                    host = %host,
                    expected = %pending.domain,
                    "ACME challenge requested for a different host"
                );
                return None;
            }
        }
        trace!(token = %token, domain = %pending.domain, "Serving ACME challenge");
        Some(pending.key_authorization.clone())
    }

    /// Check if this is an ACME challenge request path
    ///
    /// Returns `Some(token)` if the path matches the challenge prefix,
    /// `None` otherwise.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Get the number of pending challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// Clear all pending challenges
    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }
}

/// Strip an optional `:port` suffix from a Host header value
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
