//! Signal handling for graceful shutdown.
//!
//! The core never installs handlers itself; programs embedding it opt in by
//! calling [`install_shutdown_handler`] once during startup. Installing a
//! second time is an error in the underlying registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Install a SIGINT/SIGTERM handler and return the flag it sets.
///
/// The first signal flips the flag so the program can drain and exit; a
/// second signal forces immediate exit.
pub fn install_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, exiting gracefully");
    })
    .expect("failed to set signal handler");

    shutdown
}
