//! Monotonic clock anchored at first use.

use std::sync::OnceLock;
use std::time::Instant;

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Milliseconds elapsed since the process clock origin.
pub(crate) fn now_ms() -> u64 {
    origin().elapsed().as_millis() as u64
}

/// Seconds elapsed since the process clock origin.
pub(crate) fn now_secs() -> u64 {
    origin().elapsed().as_secs()
}
