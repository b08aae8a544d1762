//! Per-key single-flight execution
//!
//! At most one run per key is in progress at a time. Callers arriving while a
//! run is active wait for that run's outcome instead of starting another.
//! Runs are spawned onto the runtime so a waiter giving up (for example a
//! client closing its handshake) does not cancel the run for everyone else.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::error::AcmeError;

/// Outcome of a run, awaitable by any number of waiters
pub type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, AcmeError>>>;

struct Slot<T: Clone> {
    id: u64,
    abort: AbortHandle,
    outcome: SharedOutcome<T>,
}

/// Table of in-flight runs keyed by name
pub struct SingleFlight<T: Clone> {
    slots: Arc<DashMap<String, Slot<T>>>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the run for `key`, starting it with `start` if none is active
    ///
    /// Returns the shared outcome and whether this caller started the run.
    /// The slot is released as soon as the run finishes, so the next call
    /// after a failure starts from scratch.
    pub fn join<F, Fut>(&self, key: &str, start: F) -> (SharedOutcome<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AcmeError>> + Send + 'static,
    {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                trace!(key = %key, "Joining in-flight run");
                (entry.get().outcome.clone(), false)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let run = start();

                let slots = Arc::clone(&self.slots);
                let owned_key = key.to_string();
                let handle = tokio::spawn(async move {
                    let result = run.await;
                    slots.remove_if(&owned_key, |_, slot| slot.id == id);
                    result
                });
                let abort = handle.abort_handle();

                // An aborted run never reaches its own release
                let slots = Arc::clone(&self.slots);
                let owned_key = key.to_string();
                let outcome = async move {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => {
                            Err(AcmeError::Aborted("run cancelled".to_string()))
                        }
                        Err(e) => Err(AcmeError::Aborted(format!("run panicked: {}", e))),
                    };
                    slots.remove_if(&owned_key, |_, slot| slot.id == id);
                    result
                }
                .boxed()
                .shared();

                debug!(key = %key, "Started new run");
                entry.insert(Slot {
                    id,
                    abort,
                    outcome: outcome.clone(),
                });
                (outcome, true)
            }
        }
    }

    /// Whether a run for `key` is in progress
    pub fn in_flight(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of runs in progress
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Abort every run and release all slots
    ///
    /// Waiters observe [`AcmeError::Aborted`].
    pub fn abort_all(&self) {
        let count = self.slots.len();
        self.slots.retain(|_, slot| {
            slot.abort.abort();
            false
        });
        if count > 0 {
            debug!(aborted = count, "Aborted in-flight runs");
        }
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::error::IssuanceStep;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_joins_share_one_run() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicU32::new(0));

        let waiters: Vec<_> = (0..10)
            .map(|_| {
                let flights = Arc::clone(&flights);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    let (outcome, _) = flights.join("example.com", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    });
                    outcome.await
                })
            })
            .collect();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_failure_releases_slot() {
        let flights = SingleFlight::<u32>::new();

        let (outcome, leader) = flights.join("example.com", || async {
            Err(AcmeError::Timeout {
                step: IssuanceStep::PollingValidation,
                elapsed: Duration::from_secs(120),
            })
        });
        assert!(leader);
        assert!(matches!(outcome.await, Err(AcmeError::Timeout { .. })));
        assert!(!flights.in_flight("example.com"));

        let (outcome, leader) = flights.join("example.com", || async { Ok(1) });
        assert!(leader);
        assert_eq!(outcome.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let flights = SingleFlight::<&'static str>::new();

        let (slow, _) = flights.join("slow.com", || async {
            std::future::pending::<Result<&'static str, AcmeError>>().await
        });
        let (fast, leader) = flights.join("fast.com", || async { Ok("fast") });

        assert!(leader);
        assert_eq!(fast.await.unwrap(), "fast");
        assert!(flights.in_flight("slow.com"));

        flights.abort_all();
        assert!(matches!(slow.await, Err(AcmeError::Aborted(_))));
        assert!(flights.is_empty());
    }
}
