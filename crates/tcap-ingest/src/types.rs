use std::sync::Arc;

use futures_util::future::BoxFuture;
use tcap_schemas::DecodedTrade;

/// Offset carried by messages injected through the replay endpoint. Replay
/// messages have no broker context, so the persister skips cursor advancement
/// for them.
pub const REPLAY_OFFSET: i64 = -1;

/// Handle onto the stream reader's durable cursor.
///
/// Advancing to offset O asserts that every message at offset ≤ O on this
/// partition has a durable row in the audit store or the DLQ. Only the
/// persister calls this.
pub trait CursorStore: Send + Sync {
    fn advance(&self, offset: i64) -> anyhow::Result<()>;
}

/// Consumer-side backpressure against the stream broker.
///
/// Both calls are idempotent; callers signal freely without tracking whether
/// the stream is currently paused.
pub trait FlowControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Where the buffer hands off a drained batch. Implemented by
/// [`crate::BatchPersister`]; tests substitute recording sinks.
pub trait BatchSink: Send + Sync {
    /// Drive `batch` to durability. Must not return until every message in
    /// the batch has been persisted or deliberately dead-lettered; under a
    /// database outage this blocks rather than dropping data.
    fn run_batch<'a>(&'a self, batch: Vec<PendingMessage>) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Clone)]
pub enum MessageBody {
    Valid(DecodedTrade),
    Invalid { error: String },
}

/// One stream delivery on its way to the database, ordered by `offset`.
#[derive(Clone)]
pub struct PendingMessage {
    pub offset: i64,
    pub raw: Vec<u8>,
    pub body: MessageBody,
    pub cursor: Option<Arc<dyn CursorStore>>,
}

impl PendingMessage {
    pub fn is_valid(&self) -> bool {
        matches!(self.body, MessageBody::Valid(_))
    }
}
