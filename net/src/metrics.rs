//! Event loop and transport metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "bytes_received",
    description = "Total bytes read from sockets"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "selector_rebuilds",
    description = "Times the selector was replaced after busy-spin detection"
)]
pub static SELECTOR_REBUILDS: Counter = Counter::new();

#[metric(
    name = "selector_wakeups",
    description = "Cross-thread wakeups issued to blocked selectors"
)]
pub static SELECTOR_WAKEUPS: Counter = Counter::new();

#[metric(
    name = "tasks_executed",
    description = "Tasks drained from event loop queues"
)]
pub static TASKS_EXECUTED: Counter = Counter::new();

#[metric(
    name = "writes_completed",
    description = "Write entries fully drained to the socket"
)]
pub static WRITES_COMPLETED: Counter = Counter::new();
