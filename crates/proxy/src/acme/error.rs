//! ACME error types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Steps of a single issuance run, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssuanceStep {
    DirectoryDiscovery,
    AccountReady,
    OrderCreated,
    ChallengeOffered,
    ChallengeSubmitted,
    PollingValidation,
    Finalize,
    Download,
}

impl IssuanceStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssuanceStep::DirectoryDiscovery => "directory-discovery",
            IssuanceStep::AccountReady => "account-ready",
            IssuanceStep::OrderCreated => "order-created",
            IssuanceStep::ChallengeOffered => "challenge-offered",
            IssuanceStep::ChallengeSubmitted => "challenge-submitted",
            IssuanceStep::PollingValidation => "polling-validation",
            IssuanceStep::Finalize => "finalize",
            IssuanceStep::Download => "download",
        }
    }
}

impl fmt::Display for IssuanceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate cache errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Refusing to store record under name '{0}'")]
    InvalidName(String),
}

/// Errors surfaced by the certificate manager and the issuance client
///
/// Cloneable so that every waiter of a single-flight issuance run receives
/// the same outcome.
#[derive(Error, Debug, Clone)]
pub enum AcmeError {
    #[error("domain '{0}' is not whitelisted")]
    UnauthorizedDomain(String),

    #[error("client hello carried no server name")]
    MissingServerName,

    #[error("transient failure during {step}: {message}")]
    Transient { step: IssuanceStep, message: String },

    #[error("{step} rejected by the certificate authority: {message}")]
    Rejected { step: IssuanceStep, message: String },

    #[error("{step} timed out after {elapsed:?}")]
    Timeout { step: IssuanceStep, elapsed: Duration },

    #[error("storage error: {0}")]
    Storage(Arc<StorageError>),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("issuance aborted: {0}")]
    Aborted(String),
}

impl AcmeError {
    /// Whether a single request failing with this error may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, AcmeError::Transient { .. } | AcmeError::Timeout { .. })
    }

    /// The protocol step this error was raised in, if any
    pub fn step(&self) -> Option<IssuanceStep> {
        match self {
            AcmeError::Transient { step, .. }
            | AcmeError::Rejected { step, .. }
            | AcmeError::Timeout { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl From<StorageError> for AcmeError {
    fn from(err: StorageError) -> Self {
        AcmeError::Storage(Arc::new(err))
    }
}
