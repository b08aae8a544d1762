//! Backend connectivity check

use super::{ValidationResult, ValidationWarning};
use crate::ProxyConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Check the backend target with a TCP connect
///
/// An unreachable backend is only a warning: the proxy can start before the
/// backend does.
pub async fn validate_target(config: &ProxyConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    let Some(host) = config.target.host_str() else {
        return result;
    };
    let Some(port) = config.target.port_or_known_default() else {
        return result;
    };
    let address = format!("{}:{}", host.trim_start_matches('[').trim_end_matches(']'), port);

    match timeout(Duration::from_secs(5), TcpStream::connect(&address)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            result.add_warning(ValidationWarning::new(format!(
                "Target '{}' unreachable: {}",
                address, e
            )));
        }
        Err(_) => {
            result.add_warning(ValidationWarning::new(format!(
                "Target '{}' connection timeout (5s)",
                address
            )));
        }
    }

    result
}
