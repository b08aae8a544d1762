//! Timeouts, retries and status polling for ACME requests
//!
//! Every request to the certificate authority runs under a hard deadline and
//! is retried with exponential backoff when it fails transiently. Challenge
//! validation and order processing are polled until a terminal state or an
//! overall deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::{AcmeError, IssuanceStep};

/// Per-request deadline and retry budget
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Hard deadline of a single attempt
    pub request_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on the delay between retries
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Polling cadence for validation and order status
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total time allowed for the state to become terminal
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            deadline: Duration::from_secs(120),
        }
    }
}

/// Exponential backoff delays, doubling up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.saturating_mul(2).min(self.max);
        Some(current)
    }
}

/// Run `op` under the request deadline, retrying transient failures
///
/// A deadline overrun is reported as [`AcmeError::Timeout`] and counts as
/// transient. Permanent errors are returned immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    step: IssuanceStep,
    mut op: F,
) -> Result<T, AcmeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AcmeError>>,
{
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.request_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(AcmeError::Timeout {
                step,
                elapsed: policy.request_timeout,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt <= policy.max_retries => {
                let delay = backoff.next().unwrap_or(policy.max_backoff);
                warn!(
                    step = %step,
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "ACME request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of one status check
#[derive(Debug)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Run `check` until it reports a terminal state or the deadline passes
///
/// Transient check failures are treated like a pending state. Permanent
/// failures end polling immediately.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    step: IssuanceStep,
    mut check: F,
) -> Result<T, AcmeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, AcmeError>>,
{
    let started = Instant::now();
    let deadline = started + policy.deadline;
    let mut delays = Backoff::new(policy.initial_delay, policy.max_delay);

    loop {
        match check().await {
            Ok(PollStatus::Ready(value)) => return Ok(value),
            Ok(PollStatus::Pending) => {}
            Err(e) if e.is_transient() => {
                debug!(step = %step, error = %e, "Status check failed, polling again");
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(AcmeError::Timeout {
                step,
                elapsed: now - started,
            });
        }
        let delay = delays
            .next()
            .unwrap_or(policy.max_delay)
            .min(deadline - now);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> AcmeError {
        AcmeError::Transient {
            step: IssuanceStep::OrderCreated,
            message: "503".to_string(),
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            request_timeout: Duration::from_secs(5),
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(1), Duration::from_secs(5))
            .take(5)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = with_retry(&policy(3), IssuanceStep::OrderCreated, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> =
            with_retry(&policy(2), IssuanceStep::OrderCreated, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(matches!(result, Err(AcmeError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> =
            with_retry(&policy(3), IssuanceStep::Finalize, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AcmeError::Rejected {
                    step: IssuanceStep::Finalize,
                    message: "badCSR".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(AcmeError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_request_times_out() {
        let result: Result<(), _> =
            with_retry(&policy(0), IssuanceStep::Download, || async {
                std::future::pending::<Result<(), AcmeError>>().await
            })
            .await;

        match result {
            Err(AcmeError::Timeout { step, elapsed }) => {
                assert_eq!(step, IssuanceStep::Download);
                assert_eq!(elapsed, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready() {
        let checks = AtomicU32::new(0);
        let checks = &checks;

        let value = poll_until(
            &PollPolicy::default(),
            IssuanceStep::PollingValidation,
            || async move {
                match checks.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(PollStatus::Pending),
                    1 => Err(transient()),
                    _ => Ok(PollStatus::Ready("valid")),
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "valid");
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_deadline() {
        let poll = PollPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            deadline: Duration::from_secs(10),
        };

        let result: Result<(), _> =
            poll_until(&poll, IssuanceStep::PollingValidation, || async {
                Ok(PollStatus::Pending)
            })
            .await;

        match result {
            Err(AcmeError::Timeout { step, elapsed }) => {
                assert_eq!(step, IssuanceStep::PollingValidation);
                assert!(elapsed >= Duration::from_secs(10));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(initial_ms in 1u64..10_000, max_ms in 1u64..60_000) {
            let max = Duration::from_millis(max_ms);
            let delays: Vec<_> = Backoff::new(Duration::from_millis(initial_ms), max)
                .take(20)
                .collect();
            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            prop_assert!(delays.iter().all(|d| *d <= max));
        }
    }
}
