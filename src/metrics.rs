//! Engine metrics.
//!
//! Process-wide counters for connections, bytes, ring utilization and
//! back-pressure events, registered with `metriken` for exposition.
//! Per-loop watermark statistics live on the loop itself
//! ([`crate::event_loop::BackpressureStats`]); the statics here aggregate
//! across loops.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "ringnet/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "ringnet/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "ringnet/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "ringnet/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "ringnet/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Ring utilization ─────────────────────────────────────────────

#[metric(name = "ringnet/cqe/processed", description = "Total CQEs processed")]
pub static CQE_PROCESSED: Counter = Counter::new();

#[metric(
    name = "ringnet/sqe/submit_failures",
    description = "SQE submissions dropped because the queue stayed full"
)]
pub static SQE_SUBMIT_FAILURES: Counter = Counter::new();

// ── Cross-thread task ring ───────────────────────────────────────

#[metric(
    name = "ringnet/tasks/dropped",
    description = "Tasks dropped because a loop's pending ring was full"
)]
pub static TASKS_DROPPED: Counter = Counter::new();

#[metric(
    name = "ringnet/tasks/high_watermark",
    description = "Task ring high-watermark crossings"
)]
pub static QUEUE_HIGH_MARK_EVENTS: Counter = Counter::new();

#[metric(
    name = "ringnet/tasks/low_watermark",
    description = "Task ring low-watermark recoveries"
)]
pub static QUEUE_LOW_MARK_EVENTS: Counter = Counter::new();

// ── Buffers and timeouts ─────────────────────────────────────────

#[metric(
    name = "ringnet/buffers/exhausted",
    description = "Fixed buffer pool exhaustion events (reads fell back to heap buffers)"
)]
pub static FIXED_BUFFERS_EXHAUSTED: Counter = Counter::new();

#[metric(
    name = "ringnet/timeouts/read",
    description = "Connections closed by the per-read idle deadline"
)]
pub static READ_TIMEOUTS: Counter = Counter::new();
