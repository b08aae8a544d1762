//! Signal handling for shutdown.
//!
//! Bridges OS signals with the async runtime: a dedicated thread waits on
//! `signal-hook` and cancels the shutdown token.

use std::io;
use std::os::raw::c_int;
use std::thread;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Signals that start a graceful shutdown
pub const SHUTDOWN_SIGNALS: [c_int; 2] = [SIGTERM, SIGINT];

/// Cancel `shutdown` on SIGINT or SIGTERM
///
/// A second signal while shutting down exits the process immediately.
pub fn spawn_signal_listener(shutdown: CancellationToken) -> io::Result<()> {
    spawn_signal_listener_for(&SHUTDOWN_SIGNALS, shutdown)
}

/// Cancel `shutdown` when any of `signals` arrives
pub fn spawn_signal_listener_for(
    signals: &[c_int],
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut signals = Signals::new(signals)?;
    debug!("Registered shutdown signal handlers");

    thread::Builder::new()
        .name("leproxy-signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                if shutdown.is_cancelled() {
                    warn!(signal = sig, "Received second shutdown signal, exiting immediately");
                    std::process::exit(1);
                }
                info!(signal = sig, "Received shutdown signal, initiating graceful shutdown");
                shutdown.cancel();
            }
        })?;

    Ok(())
}
