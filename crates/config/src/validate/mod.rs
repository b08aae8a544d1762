//! Pre-flight checks for `leproxy --test`
//!
//! Hard errors come from [`ProxyConfig::validate`](crate::ProxyConfig::validate).
//! The checks here only produce warnings: the configuration is servable, but
//! something about it is likely to hurt in production.

pub mod lint;
#[cfg(feature = "runtime")]
pub mod network;

use std::fmt;

/// A non-fatal finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Collected warnings of a validation pass
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Merge another result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.warnings.extend(other.warnings);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
