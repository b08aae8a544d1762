//! Configuration linting for production readiness

use super::{ValidationResult, ValidationWarning};
use crate::{ProxyConfig, LETSENCRYPT_STAGING};

/// Lint configuration for likely deployment mistakes
pub fn lint_config(config: &ProxyConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    match config.http.listen {
        None => result.add_warning(ValidationWarning::new(
            "Plain HTTP listener disabled: HTTP-01 challenges cannot be answered, \
             certificates will only come from the cache",
        )),
        Some(addr) if addr.port() != 80 => result.add_warning(ValidationWarning::new(format!(
            "Plain HTTP listener on port {} (the CA validates on port 80, \
             a port forward is required)",
            addr.port()
        ))),
        Some(_) => {}
    }

    if config.listen.port() != 443 {
        result.add_warning(ValidationWarning::new(format!(
            "TLS listener on port {} instead of 443",
            config.listen.port()
        )));
    }

    if config.acme.directory_url == LETSENCRYPT_STAGING {
        result.add_warning(ValidationWarning::new(
            "Using the Let's Encrypt staging directory (certificates are not trusted by browsers)",
        ));
    }

    if config.acme.email.is_none() {
        result.add_warning(ValidationWarning::new(
            "No contact e-mail configured (the CA cannot send expiry notices)",
        ));
    }

    if config.acme.renew_before_days >= 60 {
        result.add_warning(ValidationWarning::new(format!(
            "renew-before-days {} is close to the 90 day certificate lifetime, \
             certificates will be renewed on almost every check",
            config.acme.renew_before_days
        )));
    }

    if config.target.scheme() == "http"
        && config
            .target
            .host_str()
            .is_some_and(|host| config.domains.iter().any(|d| d == host))
    {
        result.add_warning(ValidationWarning::new(format!(
            "Target {} points back at a proxied domain",
            config.target
        )));
    }

    result
}
