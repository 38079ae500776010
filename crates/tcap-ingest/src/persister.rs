//! Layered write path for drained batches.
//!
//! 1. Fast path: the whole batch in one transaction.
//! 2. Safe path: per-item transactions, stopping at the first item that
//!    neither persisted nor dead-lettered.
//! 3. DLQ: items the database rejects on integrity grounds.
//! 4. Disk log: hex dump when even the DLQ write fails.
//!
//! The cursor advancement rule: offset O is committed only once every message
//! at offset ≤ O has a durable audit row or DLQ row. Both paths advance the
//! cursor strictly for the completed prefix.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use tracing::{debug, error, warn};

use tcap_config::{CircuitSettings, IngestSettings};
use tcap_schemas::encode_event;

use crate::breaker::CircuitBreaker;
use crate::types::{BatchSink, FlowControl, MessageBody, PendingMessage};

/// Outcome of one guarded persist attempt.
#[derive(Debug)]
pub enum PersistError {
    /// The circuit is open: fail fast, back the stream off, retry later.
    CircuitOpen,
    /// The database refused or the connection broke.
    Db(anyhow::Error),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::CircuitOpen => write!(f, "persist not permitted: circuit open"),
            PersistError::Db(err) => write!(f, "persist failed: {err:#}"),
        }
    }
}

impl std::error::Error for PersistError {}

pub struct BatchPersister {
    pool: PgPool,
    breaker: CircuitBreaker,
    flow: Arc<dyn FlowControl>,
    db_retry_backoff: Duration,
    fallback_log: PathBuf,
}

impl BatchPersister {
    pub fn new(
        pool: PgPool,
        circuit: CircuitSettings,
        ingest: &IngestSettings,
        flow: Arc<dyn FlowControl>,
    ) -> Self {
        BatchPersister {
            pool,
            breaker: CircuitBreaker::new(circuit),
            flow,
            db_retry_backoff: Duration::from_millis(ingest.db_retry_backoff_ms),
            fallback_log: PathBuf::from("dlq-fallback.log"),
        }
    }

    pub fn with_fallback_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_log = path.into();
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Drive a batch to durability, however long it takes.
    ///
    /// Never drops data: under a database outage this pauses the stream,
    /// sleeps, and retries the not-yet-durable suffix of the batch. Returns
    /// once every message has an audit/DLQ row and the cursor has advanced.
    pub async fn run_batch(&self, mut batch: Vec<PendingMessage>) -> Result<()> {
        while !batch.is_empty() {
            match self.persist_batch(&batch).await {
                Ok(()) => return Ok(()),
                Err(PersistError::CircuitOpen) => self.wait_for_db().await,
                Err(PersistError::Db(err)) => {
                    warn!(
                        batch_len = batch.len(),
                        error = format!("{err:#}"),
                        "batch persist failed; switching to per-item path"
                    );
                    let completed = self.persist_each(&batch).await;
                    batch.drain(..completed);
                    if !batch.is_empty() {
                        self.wait_for_db().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fast path: the whole batch in one transaction, then cursor advance.
    pub async fn persist_batch(&self, batch: &[PendingMessage]) -> Result<(), PersistError> {
        if !self.breaker.allow() {
            return Err(PersistError::CircuitOpen);
        }
        match self.write_batch_txn(batch).await {
            Ok(()) => {
                self.breaker.record_success();
                debug!(batch_len = batch.len(), "batch persisted");
                self.advance_cursor(batch);
                Ok(())
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(PersistError::Db(err))
            }
        }
    }

    /// Safe path: per-item transactions in offset order.
    ///
    /// Returns the length of the completed prefix: items that either
    /// persisted or were deliberately dead-lettered. Stops at the first item
    /// that did neither (transient failure or open circuit); the cursor is
    /// advanced for the prefix only and the caller retries the remainder.
    pub async fn persist_each(&self, batch: &[PendingMessage]) -> usize {
        let mut completed = 0;
        for msg in batch {
            if !self.breaker.allow() {
                break;
            }
            match self.write_single_txn(msg).await {
                Ok(()) => {
                    self.breaker.record_success();
                    completed += 1;
                }
                Err(err) if is_integrity_violation(&err) => {
                    // The database is healthy; this row is unacceptable and
                    // will stay so. Quarantine and move on.
                    self.breaker.record_success();
                    self.save_to_dlq(msg, &format!("integrity violation: {err:#}"))
                        .await;
                    completed += 1;
                }
                Err(err) => {
                    self.breaker.record_failure();
                    warn!(
                        offset = msg.offset,
                        error = format!("{err:#}"),
                        "single-item persist failed; stopping at prefix"
                    );
                    break;
                }
            }
        }
        self.advance_cursor(&batch[..completed]);
        completed
    }

    /// One message in its own transaction, circuit-guarded.
    pub async fn persist_single(&self, msg: &PendingMessage) -> Result<(), PersistError> {
        if !self.breaker.allow() {
            return Err(PersistError::CircuitOpen);
        }
        match self.write_single_txn(msg).await {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(PersistError::Db(err))
            }
        }
    }

    /// Write one DLQ row in its own transaction. Tolerates its own failure:
    /// the payload goes to the hex disk log and the call returns quietly, so
    /// the cursor can always advance past truly poisoned input.
    pub async fn save_to_dlq(&self, msg: &PendingMessage, reason: &str) {
        let res = async {
            let mut tx = self.pool.begin().await.context("begin dlq txn")?;
            tcap_db::insert_dlq(&mut tx, &msg.raw, reason).await?;
            tx.commit().await.context("commit dlq txn")?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(err) = res {
            error!(
                offset = msg.offset,
                error = format!("{err:#}"),
                "DLQ write failed; dumping payload to disk log"
            );
            self.write_fallback_line(msg, reason);
        }
    }

    async fn write_batch_txn(&self, batch: &[PendingMessage]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin batch txn")?;
        for msg in batch {
            write_message(&mut tx, msg).await?;
        }
        tx.commit().await.context("commit batch txn")?;
        Ok(())
    }

    async fn write_single_txn(&self, msg: &PendingMessage) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin single txn")?;
        write_message(&mut tx, msg).await?;
        tx.commit().await.context("commit single txn")?;
        Ok(())
    }

    /// Pause the stream and wait out a database outage. Resumption is the
    /// buffer's watermark logic once flushing succeeds again.
    async fn wait_for_db(&self) {
        self.flow.pause();
        warn!(
            backoff_ms = self.db_retry_backoff.as_millis() as u64,
            "database unavailable; stream paused, retrying batch"
        );
        tokio::time::sleep(self.db_retry_backoff).await;
    }

    /// Advance the stream cursor to the last completed message that carries
    /// a broker context. Replay messages (no context) are skipped.
    ///
    /// A failed advance is logged, not propagated: the rows are durable, so
    /// redelivery after the stale cursor is absorbed by trade_id idempotency.
    fn advance_cursor(&self, prefix: &[PendingMessage]) {
        let Some(last) = prefix.iter().rev().find(|m| m.cursor.is_some()) else {
            return;
        };
        if let Some(cursor) = &last.cursor {
            if let Err(err) = cursor.advance(last.offset) {
                warn!(
                    offset = last.offset,
                    error = format!("{err:#}"),
                    "cursor advance failed; redelivery expected"
                );
            }
        }
    }

    fn write_fallback_line(&self, msg: &PendingMessage, reason: &str) {
        use std::io::Write;
        let line = format!(
            "{}\t{}\t{}\n",
            chrono::Utc::now().to_rfc3339(),
            reason.replace(['\t', '\n'], " "),
            hex::encode(&msg.raw)
        );
        let res = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_log)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(err) = res {
            // Terminal layer: nothing left to do but say so loudly.
            error!(
                path = %self.fallback_log.display(),
                error = %err,
                "fallback disk log write failed; payload only in memory"
            );
        }
    }
}

/// Write composition for one message, inside the caller's transaction:
/// valid → audit row + outbox row; invalid → audit row + DLQ row.
async fn write_message(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    msg: &PendingMessage,
) -> Result<()> {
    match &msg.body {
        MessageBody::Valid(trade) => {
            tcap_db::insert_audit_valid(tx, trade).await?;
            let payload = encode_event(trade);
            tcap_db::insert_outbox_pending(tx, trade.portfolio_id, trade.trade_id, &payload)
                .await?;
        }
        MessageBody::Invalid { error } => {
            tcap_db::insert_audit_invalid(tx, &msg.raw).await?;
            tcap_db::insert_dlq(tx, &msg.raw, error).await?;
        }
    }
    Ok(())
}

fn is_integrity_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .map(tcap_db::is_integrity_violation)
        .unwrap_or(false)
}

impl BatchSink for BatchPersister {
    fn run_batch<'a>(&'a self, batch: Vec<PendingMessage>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run_batch(batch))
    }
}
