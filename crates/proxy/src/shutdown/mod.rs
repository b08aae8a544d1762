//! Graceful shutdown.
//!
//! SIGINT or SIGTERM cancels the process-wide [`CancellationToken`]. Listeners
//! stop accepting, open connections get a bounded grace period tracked by
//! [`ConnectionDrain`], and whatever remains afterwards is aborted.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

mod coordinator;
mod signals;

pub use coordinator::{ConnectionDrain, DrainGuard};
pub use signals::{spawn_signal_listener, spawn_signal_listener_for, SHUTDOWN_SIGNALS};
