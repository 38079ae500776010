use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use tcap_schemas::DecodedTrade;

pub const ENV_DB_URL: &str = "TCAP_DATABASE_URL";

/// One persister transaction, one dispatcher lease plus its group commit,
/// and a little headroom for the admin probes.
const POOL_MAX_CONNECTIONS: u32 = 10;

/// Open a bounded pool against an explicit database URL.
pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect(url)
        .await
        .context("postgres connection refused")
}

/// Open a pool against the database named by `TCAP_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| anyhow!("{ENV_DB_URL} is not set; nowhere to capture trades into"))?;
    connect(&url).await
}

/// Apply the embedded schema migrations. Safe to call on every startup.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("schema migration did not apply")?;
    Ok(())
}

/// Pool for integration tests: env-configured, with the schema guaranteed
/// current before the pool is handed out.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await.context("test schema setup")?;
    Ok(pool)
}

/// Probe behind the admin status endpoint. A row coming back at all proves
/// connectivity; `to_regclass` tells us whether the schema has ever been
/// migrated into this database.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (reachable, has_outbox): (bool, bool) =
        sqlx::query_as("select true, to_regclass('public.outbox') is not null")
            .fetch_one(pool)
            .await
            .context("status probe failed")?;

    Ok(DbStatus {
        ok: reachable,
        has_outbox_table: has_outbox,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_outbox_table: bool,
}

/// Detect a Postgres integrity violation (SQLSTATE class 23).
///
/// Unique violations on trade_id never reach this path (the inserts use
/// `on conflict do nothing`), so a class-23 error here means the row itself
/// is unacceptable to the schema (null, check, fk) and will stay so on
/// every retry.
pub fn is_integrity_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|c| c.starts_with("23"))
            .unwrap_or(false),
        _ => false,
    }
}

// -----------------------------
// Ingest-side writes
// -----------------------------

/// Insert the audit row for a decoded trade.
///
/// Idempotent: a replayed trade_id is absorbed by `on conflict do nothing`,
/// so stream replay after a crash re-runs cleanly inside one transaction.
pub async fn insert_audit_valid(conn: &mut PgConnection, trade: &DecodedTrade) -> Result<()> {
    sqlx::query(
        r#"
        insert into audit (
          portfolio_id, trade_id, symbol, side, price_per_stock,
          quantity, event_timestamp, valid
        ) values (
          $1, $2, $3, $4, $5, $6, $7, true
        )
        on conflict (trade_id) do nothing
        "#,
    )
    .bind(trade.portfolio_id)
    .bind(trade.trade_id)
    .bind(&trade.symbol)
    .bind(trade.side.map(|s| s.as_str()))
    .bind(&trade.price_per_stock)
    .bind(trade.quantity)
    .bind(trade.event_timestamp)
    .execute(conn)
    .await
    .context("insert_audit_valid failed")?;
    Ok(())
}

/// Insert the audit row for an undecodable message, raw bytes embedded.
/// The parse error itself travels on the DLQ row, not here.
pub async fn insert_audit_invalid(conn: &mut PgConnection, raw_payload: &[u8]) -> Result<()> {
    sqlx::query(
        r#"
        insert into audit (valid, raw_payload)
        values (false, $1)
        "#,
    )
    .bind(raw_payload)
    .execute(conn)
    .await
    .context("insert_audit_invalid failed")?;
    Ok(())
}

/// Enqueue the downstream bytes for a trade. Created in the same transaction
/// as its audit row; `on conflict do nothing` keeps replay idempotent:
/// at most one outbox row ever exists per trade_id.
pub async fn insert_outbox_pending(
    conn: &mut PgConnection,
    portfolio_id: Uuid,
    trade_id: Uuid,
    payload: &[u8],
) -> Result<()> {
    sqlx::query(
        r#"
        insert into outbox (portfolio_id, trade_id, payload, status)
        values ($1, $2, $3, 'PENDING')
        on conflict (trade_id) do nothing
        "#,
    )
    .bind(portfolio_id)
    .bind(trade_id)
    .bind(payload)
    .execute(conn)
    .await
    .context("insert_outbox_pending failed")?;
    Ok(())
}

/// Write one dead-letter row. Write-only from the pipeline's perspective;
/// nothing reads it back on the hot path.
pub async fn insert_dlq(
    conn: &mut PgConnection,
    raw_payload: &[u8],
    error_detail: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into dlq (raw_payload, error_detail)
        values ($1, $2)
        "#,
    )
    .bind(raw_payload)
    .bind(error_detail)
    .execute(conn)
    .await
    .context("insert_dlq failed")?;
    Ok(())
}

// -----------------------------
// Dispatcher-side queries
// -----------------------------

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub outbox_id: i64,
    pub created_at: DateTime<Utc>,
    pub portfolio_id: Uuid,
    pub trade_id: Uuid,
    pub payload: Vec<u8>,
    pub status: String, // PENDING | SENT
    pub attempts: i32,
    pub sent_at: Option<DateTime<Utc>>,
}

fn outbox_row_from(row: sqlx::postgres::PgRow) -> Result<OutboxRow> {
    Ok(OutboxRow {
        outbox_id: row.try_get("outbox_id")?,
        created_at: row.try_get("created_at")?,
        portfolio_id: row.try_get("portfolio_id")?,
        trade_id: row.try_get("trade_id")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        sent_at: row.try_get("sent_at")?,
    })
}

/// Lease-and-fetch for one dispatcher iteration.
///
/// Must run inside an open transaction, and the transaction must stay open
/// until the iteration's per-group commits have finished: the advisory locks
/// taken here are `xact`-scoped, and they are what stops a second process
/// from dispatching the same portfolio concurrently.
///
/// `pg_try_advisory_xact_lock` never waits: a portfolio leased by another
/// instance is simply invisible this iteration. Returned rows are ordered by
/// `(created_at, outbox_id)` ascending across all leased portfolios.
pub async fn lease_pending_batch(conn: &mut PgConnection, limit: i64) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query(
        r#"
        select outbox_id, created_at, portfolio_id, trade_id, payload,
               status, attempts, sent_at
        from outbox
        where status = 'PENDING'
          and portfolio_id in (
              select p.portfolio_id
              from (
                  select distinct portfolio_id
                  from outbox
                  where status = 'PENDING'
              ) p
              where pg_try_advisory_xact_lock(hashtextextended(p.portfolio_id::text, 0))
          )
        order by created_at asc, outbox_id asc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
    .context("lease_pending_batch failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(outbox_row_from(row)?);
    }
    Ok(out)
}

/// Mark a dispatched prefix as SENT in one statement.
///
/// Returns the number of rows transitioned. Guarded on status so a row the
/// dispatcher re-fetched after an earlier partial commit is not double-stamped.
pub async fn mark_sent_batch(conn: &mut PgConnection, outbox_ids: &[i64]) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update outbox
           set status  = 'SENT',
               sent_at = coalesce(sent_at, now())
         where outbox_id = any($1)
           and status = 'PENDING'
        "#,
    )
    .bind(outbox_ids)
    .execute(conn)
    .await
    .context("mark_sent_batch failed")?;

    Ok(res.rows_affected())
}

/// Move a poisoned outbox row to the DLQ and delete it, in the caller's
/// transaction (the same one that marks the group's successful prefix SENT).
///
/// Returns false if the row no longer exists; another instance already
/// quarantined it, which is an acceptable at-least-once race.
pub async fn quarantine_poison(
    conn: &mut PgConnection,
    outbox_id: i64,
    reason: &str,
) -> Result<bool> {
    let row = sqlx::query(
        r#"
        delete from outbox
        where outbox_id = $1
        returning payload
        "#,
    )
    .bind(outbox_id)
    .fetch_optional(&mut *conn)
    .await
    .context("quarantine_poison delete failed")?;

    let Some(row) = row else { return Ok(false) };
    let payload: Vec<u8> = row.try_get("payload")?;

    insert_dlq(conn, &payload, reason).await?;
    Ok(true)
}

/// Diagnostic only: bump attempts on rows a system failure left PENDING.
/// One batched update, off the success path; nothing reads this for control
/// flow.
pub async fn bump_attempts(conn: &mut PgConnection, outbox_ids: &[i64]) -> Result<()> {
    if outbox_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        update outbox
           set attempts = attempts + 1
         where outbox_id = any($1)
        "#,
    )
    .bind(outbox_ids)
    .execute(conn)
    .await
    .context("bump_attempts failed")?;
    Ok(())
}

// -----------------------------
// Inspection helpers (tests, status surface)
// -----------------------------

pub async fn count_audit(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from audit")
        .fetch_one(pool)
        .await
        .context("count_audit failed")?;
    Ok(n)
}

pub async fn count_outbox_with_status(pool: &PgPool, status: &str) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from outbox where status = $1")
            .bind(status)
            .fetch_one(pool)
            .await
            .context("count_outbox_with_status failed")?;
    Ok(n)
}

pub async fn count_dlq(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from dlq")
        .fetch_one(pool)
        .await
        .context("count_dlq failed")?;
    Ok(n)
}

pub async fn fetch_outbox_by_trade_id(
    pool: &PgPool,
    trade_id: Uuid,
) -> Result<Option<OutboxRow>> {
    let row = sqlx::query(
        r#"
        select outbox_id, created_at, portfolio_id, trade_id, payload,
               status, attempts, sent_at
        from outbox
        where trade_id = $1
        "#,
    )
    .bind(trade_id)
    .fetch_optional(pool)
    .await
    .context("fetch_outbox_by_trade_id failed")?;

    row.map(outbox_row_from).transpose()
}

/// First PENDING row for a portfolio, the head the next lease must see.
pub async fn first_pending_for_portfolio(
    pool: &PgPool,
    portfolio_id: Uuid,
) -> Result<Option<OutboxRow>> {
    let row = sqlx::query(
        r#"
        select outbox_id, created_at, portfolio_id, trade_id, payload,
               status, attempts, sent_at
        from outbox
        where portfolio_id = $1
          and status = 'PENDING'
        order by created_at asc, outbox_id asc
        limit 1
        "#,
    )
    .bind(portfolio_id)
    .fetch_optional(pool)
    .await
    .context("first_pending_for_portfolio failed")?;

    row.map(outbox_row_from).transpose()
}

/// SENT rows for a portfolio in the order they were marked.
pub async fn sent_trade_ids_for_portfolio(
    pool: &PgPool,
    portfolio_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select trade_id
        from outbox
        where portfolio_id = $1
          and status = 'SENT'
        order by created_at asc, outbox_id asc
        "#,
    )
    .bind(portfolio_id)
    .fetch_all(pool)
    .await
    .context("sent_trade_ids_for_portfolio failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row.try_get("trade_id")?);
    }
    Ok(out)
}

pub async fn fetch_dlq_reasons(pool: &PgPool) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        select error_detail
        from dlq
        order by dlq_id asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("fetch_dlq_reasons failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row.try_get("error_detail")?);
    }
    Ok(out)
}
