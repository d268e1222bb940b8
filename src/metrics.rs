//! Core runtime metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently registered connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes read from sockets")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Total timer expirations")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "reconnects_scheduled",
    description = "Total reconnect attempts scheduled"
)]
pub static RECONNECTS_SCHEDULED: Counter = Counter::new();
