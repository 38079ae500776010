//! In-memory fakes and database seed helpers for pipeline scenarios.
//!
//! Scenario tests run against a real Postgres when `TCAP_DATABASE_URL` is
//! set and skip otherwise. They isolate themselves by using fresh portfolio
//! and trade UUIDs per run rather than truncating shared tables.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use uuid::Uuid;

use tcap_dispatch::{EventSink, SinkError};
use tcap_ingest::{CursorStore, FlowControl, MessageBody, PendingMessage};
use tcap_schemas::{decode_trade, encode_event, DecodedTrade};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Downstream log double: records every acknowledged send in receive order
/// and can be scripted to fail upcoming sends for a given partition key.
pub struct MemorySink {
    sends: Mutex<Vec<(String, Vec<u8>)>>,
    keyed_failures: Mutex<HashMap<String, VecDeque<SinkError>>>,
    delay: Duration,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// A per-send delay widens the race window in multi-instance scenarios.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(MemorySink {
            sends: Mutex::new(Vec::new()),
            keyed_failures: Mutex::new(HashMap::new()),
            delay,
        })
    }

    /// Fail the next `times` sends for `key` with clones of `err`.
    pub fn fail_next_for_key(&self, key: &str, err: SinkError, times: usize) {
        let mut map = self.keyed_failures.lock().expect("sink mutex poisoned");
        let queue = map.entry(key.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    pub fn total_sends(&self) -> usize {
        self.sends.lock().expect("sink mutex poisoned").len()
    }

    /// Acknowledged payloads for one key, in receive order.
    pub fn payloads_for_key(&self, key: &str) -> Vec<Vec<u8>> {
        self.sends
            .lock()
            .expect("sink mutex poisoned")
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn send<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(err) = self
                .keyed_failures
                .lock()
                .expect("sink mutex poisoned")
                .get_mut(key)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            self.sends
                .lock()
                .expect("sink mutex poisoned")
                .push((key.to_string(), payload.to_vec()));
            Ok(())
        })
    }
}

/// Flow control double: counts pause/resume signals and tracks the paused
/// flag the way an idempotent broker adapter would.
#[derive(Default)]
pub struct RecordingFlow {
    paused: AtomicBool,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl RecordingFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingFlow::default())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl FlowControl for RecordingFlow {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cursor double: remembers the highest offset the persister committed.
pub struct MemoryCursor {
    last: AtomicI64,
}

impl MemoryCursor {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryCursor {
            last: AtomicI64::new(-1),
        })
    }

    pub fn last(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl CursorStore for MemoryCursor {
    fn advance(&self, offset: i64) -> Result<()> {
        self.last.fetch_max(offset, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

/// Upstream wire bytes for a well-formed trade.
pub fn upstream_payload(portfolio: Uuid, trade: Uuid, symbol: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "portfolioId": portfolio,
        "tradeId": trade,
        "symbol": symbol,
        "side": "BUY",
        "pricePerStock": "101.25",
        "quantity": 10,
        "eventTimestamp": Utc::now(),
    }))
    .expect("test payload serialization must not fail")
}

/// Run raw bytes through the same decode the receiver uses.
pub fn pending_from_raw(
    offset: i64,
    raw: Vec<u8>,
    cursor: Option<Arc<dyn CursorStore>>,
) -> PendingMessage {
    let body = match decode_trade(&raw) {
        Ok(trade) => MessageBody::Valid(trade),
        Err(err) => MessageBody::Invalid {
            error: err.to_string(),
        },
    };
    PendingMessage {
        offset,
        raw,
        body,
        cursor,
    }
}

/// Downstream event bytes for seeding outbox rows directly.
pub fn event_payload(portfolio: Uuid, trade: Uuid) -> Vec<u8> {
    encode_event(&DecodedTrade {
        portfolio_id: portfolio,
        trade_id: trade,
        symbol: Some("SPY".to_string()),
        side: None,
        price_per_stock: Some("99.50".to_string()),
        quantity: Some(1),
        event_timestamp: None,
    })
}

// ---------------------------------------------------------------------------
// Seed and inspection helpers
// ---------------------------------------------------------------------------

/// Insert one PENDING outbox row with an explicit created_at, bypassing the
/// ingest path, for dispatcher-focused scenarios.
pub async fn seed_outbox_row(
    pool: &PgPool,
    portfolio: Uuid,
    trade: Uuid,
    payload: &[u8],
    created_at: DateTime<Utc>,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into outbox (created_at, portfolio_id, trade_id, payload, status)
        values ($1, $2, $3, $4, 'PENDING')
        returning outbox_id
        "#,
    )
    .bind(created_at)
    .bind(portfolio)
    .bind(trade)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("seed_outbox_row failed")?;
    Ok(id)
}

pub async fn count_audit_for_portfolio(pool: &PgPool, portfolio: Uuid) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from audit where portfolio_id = $1")
            .bind(portfolio)
            .fetch_one(pool)
            .await
            .context("count_audit_for_portfolio failed")?;
    Ok(n)
}

/// Outbox rows for one portfolio, optionally restricted by status.
pub async fn count_outbox(pool: &PgPool, portfolio: Uuid, status: Option<&str>) -> Result<i64> {
    let (n,): (i64,) = match status {
        Some(status) => {
            sqlx::query_as(
                "select count(*)::bigint from outbox where portfolio_id = $1 and status = $2",
            )
            .bind(portfolio)
            .bind(status)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_as("select count(*)::bigint from outbox where portfolio_id = $1")
                .bind(portfolio)
                .fetch_one(pool)
                .await
        }
    }
    .context("count_outbox failed")?;
    Ok(n)
}

/// DLQ rows whose payload contains `needle`. Scenario assertions scope to
/// their own markers this way because the DLQ is shared across tests.
pub async fn dlq_count_containing(pool: &PgPool, needle: &[u8]) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from dlq where position($1 in raw_payload) > 0",
    )
    .bind(needle)
    .fetch_one(pool)
    .await
    .context("dlq_count_containing failed")?;
    Ok(n)
}

pub async fn dlq_reasons_containing(pool: &PgPool, needle: &[u8]) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "select error_detail from dlq where position($1 in raw_payload) > 0 order by dlq_id asc",
    )
    .bind(needle)
    .fetch_all(pool)
    .await
    .context("dlq_reasons_containing failed")?;
    Ok(rows.into_iter().map(|(r,)| r).collect())
}

pub async fn count_invalid_audit_containing(pool: &PgPool, needle: &[u8]) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*)::bigint from audit where valid = false and position($1 in raw_payload) > 0",
    )
    .bind(needle)
    .fetch_one(pool)
    .await
    .context("count_invalid_audit_containing failed")?;
    Ok(n)
}

/// Outbox settings tuned for scenarios: a lease wide enough that leftover
/// rows from unrelated runs cannot crowd this test's portfolio out of the
/// batch.
pub fn wide_outbox_settings() -> tcap_config::OutboxSettings {
    let mut s = tcap_config::OutboxSettings::default();
    s.min_batch = 500;
    s.max_batch = 2_000;
    s
}
