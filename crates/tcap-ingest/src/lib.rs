//! Stream-side half of the capture pipeline.
//!
//! ```text
//! Stream ──► Receiver ──► IngestBuffer ──► BatchPersister ──► {audit, outbox, dlq}
//! ```
//!
//! The receiver decodes deliveries and never errors back at the stream; the
//! buffer absorbs bursts and pushes back on the stream when full; the
//! persister owns the layered write path (batch → per-item → DLQ → disk log)
//! and is the only component that advances the stream cursor.

mod breaker;
mod buffer;
mod persister;
mod receiver;
mod types;

pub use breaker::CircuitBreaker;
pub use buffer::IngestBuffer;
pub use persister::{BatchPersister, PersistError};
pub use receiver::Receiver;
pub use types::{BatchSink, CursorStore, FlowControl, MessageBody, PendingMessage, REPLAY_OFFSET};
