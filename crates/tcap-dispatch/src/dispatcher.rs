//! Outbox dispatcher: one sequential iteration at a time per process.
//!
//! Iteration protocol:
//! 1. Open the lease transaction and fetch up to sizer-many PENDING rows for
//!    portfolios this process could advisory-lock.
//! 2. Group rows by portfolio, preserving first-seen order.
//! 3. Dispatch each group through the worker; commit its result (SENT prefix,
//!    optional poison quarantine) in a transaction of its own.
//! 4. On a system failure, stop the remaining groups and escalate backoff.
//! 5. Close the lease transaction. Only now do the advisory locks release,
//!    so no other instance can have touched these portfolios mid-iteration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tcap_config::OutboxSettings;
use tcap_db::OutboxRow;

use crate::sizer::AdaptiveBatchSizer;
use crate::worker::{BatchResult, DispatchWorker, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing leased: sizer and backoff were reset.
    Idle,
    Dispatched {
        fetched: usize,
        groups_completed: usize,
        system_failure: bool,
    },
}

pub struct OutboxDispatcher<S> {
    pool: PgPool,
    worker: DispatchWorker<S>,
    sizer: Mutex<AdaptiveBatchSizer>,
    settings: OutboxSettings,
    backoff_ms: AtomicU64,
}

impl<S: EventSink + 'static> OutboxDispatcher<S> {
    pub fn new(pool: PgPool, sink: Arc<S>, settings: OutboxSettings) -> Arc<Self> {
        let worker = DispatchWorker::new(
            sink,
            std::time::Duration::from_millis(settings.kafka_send_timeout_ms),
        );
        Arc::new(OutboxDispatcher {
            pool,
            worker,
            sizer: Mutex::new(AdaptiveBatchSizer::new(&settings)),
            settings,
            backoff_ms: AtomicU64::new(0),
        })
    }

    /// Current escalated backoff; zero when the downstream is healthy.
    pub fn current_backoff_ms(&self) -> u64 {
        self.backoff_ms.load(Ordering::Relaxed)
    }

    /// One lease-dispatch-commit pass. Does not sleep; pacing (idle sleep
    /// and failure backoff) belongs to the run loop, which keeps this
    /// directly drivable by tests.
    pub async fn run_iteration(&self) -> Result<IterationOutcome> {
        let limit = self.sizer.lock().expect("sizer mutex poisoned").current();
        let started = Instant::now();

        let mut lease = self.pool.begin().await.context("begin lease txn")?;
        let rows = tcap_db::lease_pending_batch(&mut lease, limit).await?;

        if rows.is_empty() {
            lease.commit().await.context("close empty lease txn")?;
            self.sizer.lock().expect("sizer mutex poisoned").reset();
            self.backoff_ms.store(0, Ordering::Relaxed);
            return Ok(IterationOutcome::Idle);
        }

        let fetched = rows.len();
        let groups = group_by_portfolio(rows);
        debug!(fetched, groups = groups.len(), "leased pending outbox rows");

        let mut groups_completed = 0;
        let mut saw_system_failure = false;
        for group in &groups {
            let result = self.worker.process_group(&group.rows).await;
            self.commit_group(group, &result).await?;
            if result.system_failure {
                // Abort the rest of this pass; the lease keeps every one of
                // these portfolios closed to other instances until we return.
                saw_system_failure = true;
                break;
            }
            groups_completed += 1;
        }

        lease.commit().await.context("release portfolio leases")?;

        if saw_system_failure {
            self.escalate_backoff();
        } else {
            self.backoff_ms.store(0, Ordering::Relaxed);
            self.sizer
                .lock()
                .expect("sizer mutex poisoned")
                .adjust(started.elapsed(), fetched as i64);
        }

        Ok(IterationOutcome::Dispatched {
            fetched,
            groups_completed,
            system_failure: saw_system_failure,
        })
    }

    /// Commit one group's outcome: mark the successful prefix SENT in a
    /// single update and quarantine at most one poison row, atomically.
    /// Rows a system failure left behind keep status and order; only their
    /// attempts diagnostic moves.
    async fn commit_group(&self, group: &PortfolioGroup, result: &BatchResult) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin group commit txn")?;

        if !result.successful_ids.is_empty() {
            let marked = tcap_db::mark_sent_batch(&mut tx, &result.successful_ids).await?;
            debug!(portfolio_id = %group.portfolio_id, marked, "marked dispatched prefix SENT");
        }

        if let Some(pill) = &result.poison {
            let reason = format!("Poison Pill: {}", pill.reason);
            let moved = tcap_db::quarantine_poison(&mut tx, pill.outbox_id, &reason).await?;
            if moved {
                warn!(
                    portfolio_id = %group.portfolio_id,
                    outbox_id = pill.outbox_id,
                    reason = %pill.reason,
                    "poison event moved to DLQ"
                );
            }
        }

        if result.system_failure {
            let remaining: Vec<i64> = group
                .rows
                .iter()
                .map(|r| r.outbox_id)
                .filter(|id| !result.successful_ids.contains(id))
                .collect();
            tcap_db::bump_attempts(&mut tx, &remaining).await?;
        }

        tx.commit().await.context("commit group results")?;
        Ok(())
    }

    fn escalate_backoff(&self) {
        let base = self.settings.system_failure_backoff_ms;
        let max = self.settings.max_backoff_ms;
        let current = self.backoff_ms.load(Ordering::Relaxed);
        let next = if current == 0 {
            base
        } else {
            (current.saturating_mul(2)).min(max)
        };
        self.backoff_ms.store(next, Ordering::Relaxed);
        warn!(backoff_ms = next, "system failure; dispatch backing off");
    }

    /// Long-running loop. The stop flag is honored between iterations only,
    /// never mid-transaction.
    pub fn spawn(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("outbox dispatcher started");
            loop {
                if *stop.borrow() {
                    break;
                }
                let sleep_ms = match self.run_iteration().await {
                    Ok(IterationOutcome::Idle) => self.settings.idle_sleep_ms,
                    Ok(IterationOutcome::Dispatched { .. }) => self.current_backoff_ms(),
                    Err(err) => {
                        error!(error = format!("{err:#}"), "dispatcher iteration failed");
                        500
                    }
                };
                if sleep_ms > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)) => {}
                        _ = stop.changed() => {}
                    }
                }
            }
            info!("outbox dispatcher stopped");
        })
    }
}

struct PortfolioGroup {
    portfolio_id: Uuid,
    rows: Vec<OutboxRow>,
}

/// Partition rows by portfolio, preserving first-seen order. Rows inside a
/// group keep their fetch order, which is `(created_at, outbox_id)`.
fn group_by_portfolio(rows: Vec<OutboxRow>) -> Vec<PortfolioGroup> {
    let mut groups: Vec<PortfolioGroup> = Vec::new();
    for row in rows {
        match groups
            .iter_mut()
            .find(|g| g.portfolio_id == row.portfolio_id)
        {
            Some(g) => g.rows.push(row),
            None => groups.push(PortfolioGroup {
                portfolio_id: row.portfolio_id,
                rows: vec![row],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(portfolio_id: Uuid, outbox_id: i64) -> OutboxRow {
        OutboxRow {
            outbox_id,
            created_at: Utc::now(),
            portfolio_id,
            trade_id: Uuid::new_v4(),
            payload: Vec::new(),
            status: "PENDING".to_string(),
            attempts: 0,
            sent_at: None,
        }
    }

    #[test]
    fn grouping_preserves_first_seen_and_row_order() {
        let pa = Uuid::new_v4();
        let pb = Uuid::new_v4();
        let rows = vec![row(pa, 1), row(pb, 2), row(pa, 3), row(pb, 4), row(pa, 5)];

        let groups = group_by_portfolio(rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].portfolio_id, pa);
        let ids: Vec<i64> = groups[0].rows.iter().map(|r| r.outbox_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        let ids: Vec<i64> = groups[1].rows.iter().map(|r| r.outbox_id).collect();
        assert_eq!(ids, vec![2, 4]);
    }
}
