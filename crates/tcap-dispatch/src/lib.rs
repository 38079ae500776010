//! Outbox-draining half of the capture pipeline.
//!
//! The dispatcher leases portfolios through transaction-scoped advisory
//! locks, so any number of process instances can share one outbox without a
//! coordination service while per-portfolio order stays strict. The worker
//! sends one event at a time and classifies failures: poison rows are
//! quarantined to the DLQ, system failures stop the iteration and escalate
//! backoff.

mod dispatcher;
mod kafka;
mod sizer;
mod worker;

pub use dispatcher::{IterationOutcome, OutboxDispatcher};
pub use kafka::KafkaEventSink;
pub use sizer::AdaptiveBatchSizer;
pub use worker::{BatchResult, DispatchWorker, EventSink, PoisonPill, SinkError};
