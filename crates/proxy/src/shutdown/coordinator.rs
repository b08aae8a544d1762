//! Connection drain coordination.
//!
//! Tracks open connections so shutdown can wait for them, up to a limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Connection drain coordinator
///
/// Cloned into every listener; all clones count the same connections.
#[derive(Debug, Clone)]
pub struct ConnectionDrain {
    /// Open connections counter
    active: Arc<AtomicUsize>,
    /// Maximum wait time for draining
    max_drain_time: Duration,
}

/// Marks one open connection until dropped
#[derive(Debug)]
pub struct DrainGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
        trace!(active_connections = count, "Connection closed");
    }
}

impl ConnectionDrain {
    pub fn new(max_drain_time: Duration) -> Self {
        debug!(
            max_drain_time_secs = max_drain_time.as_secs(),
            "Creating connection drain coordinator"
        );
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_drain_time,
        }
    }

    /// Count a connection as open until the guard is dropped
    pub fn track(&self) -> DrainGuard {
        let count = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(active_connections = count, "Connection opened");
        DrainGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Wait for open connections to drain
    ///
    /// Returns `true` if all connections closed within the drain time,
    /// `false` if the limit was reached with connections still open.
    pub async fn wait_for_drain(&self) -> bool {
        let start = Instant::now();
        let initial_count = self.active_count();

        info!(
            active_connections = initial_count,
            max_drain_time_secs = self.max_drain_time.as_secs(),
            "Starting connection drain"
        );

        let mut last_logged_count = initial_count;

        while self.active_count() > 0 {
            if start.elapsed() > self.max_drain_time {
                warn!(
                    remaining_connections = self.active_count(),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, connections still open"
                );
                return false;
            }

            let current_count = self.active_count();
            if current_count != last_logged_count {
                debug!(
                    remaining_connections = current_count,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Draining connections"
                );
                last_logged_count = current_count;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            initial_connections = initial_count,
            "All connections drained"
        );
        true
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_drain_time(&self) -> Duration {
        self.max_drain_time
    }
}
