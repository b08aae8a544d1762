//! Background certificate renewal scheduler
//!
//! Periodically checks certificates and renews those inside the renewal
//! window, so that handshakes keep finding a valid certificate in cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::manager::CertificateManager;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 minute)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first check
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Outcome of one renewal pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenewalSummary {
    pub renewed: Vec<String>,
    pub failed: Vec<String>,
}

/// Background certificate renewal scheduler
///
/// Runs as a background task and periodically asks the
/// [`CertificateManager`] which domains are due, renewing each one through
/// the manager so that renewals share the per-domain slot with handshakes.
pub struct RenewalScheduler {
    manager: Arc<CertificateManager>,
    check_interval: Duration,
    initial_delay: Duration,
}

impl RenewalScheduler {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self {
            manager,
            check_interval: DEFAULT_CHECK_INTERVAL,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 minute to avoid
    /// excessive polling.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run the renewal loop until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            renew_before_days = self.manager.renew_before().num_days(),
            "Starting certificate renewal scheduler"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Renewal scheduler stopped before first check");
                return;
            }
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate renewal check");
                    self.check_renewals().await;
                }
            }
        }

        info!("Renewal scheduler stopped");
    }

    /// Renew every certificate currently due
    ///
    /// A failed renewal is logged and the remaining domains are still
    /// processed; the current certificate stays in service.
    pub async fn check_renewals(&self) -> RenewalSummary {
        let start = Instant::now();
        let mut summary = RenewalSummary::default();
        let manager = Arc::clone(&self.manager);
        let scan = tokio::task::spawn_blocking(move || manager.renewal_candidates(Utc::now()));
        let due = match scan.await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Renewal scan did not complete");
                return summary;
            }
        };

        if due.is_empty() {
            debug!(
                domain_count = self.manager.whitelist().len(),
                "No certificates due for renewal"
            );
            return summary;
        }

        info!(due = due.len(), "Renewing certificates");

        for domain in due {
            match self.manager.renew(&domain).await {
                Ok(cached) => {
                    info!(
                        domain = %domain,
                        expires = %cached.expires(),
                        "Certificate renewed successfully"
                    );
                    summary.renewed.push(domain);
                }
                Err(e) => {
                    error!(domain = %domain, error = %e, "Certificate renewal failed");
                    summary.failed.push(domain);
                }
            }
        }

        info!(
            renewed = summary.renewed.len(),
            failed = summary.failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Certificate renewal check completed"
        );
        summary
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("initial_delay", &self.initial_delay)
            .finish()
    }
}
