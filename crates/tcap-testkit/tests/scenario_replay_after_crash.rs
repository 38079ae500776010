use std::sync::Arc;

use uuid::Uuid;

use tcap_config::{CircuitSettings, IngestSettings};
use tcap_ingest::{BatchPersister, CursorStore, FlowControl, PendingMessage};
use tcap_testkit::{
    count_audit_for_portfolio, count_outbox, pending_from_raw, upstream_payload, MemoryCursor,
    RecordingFlow,
};

/// A crash after the durable commit but before the cursor advanced means the
/// stream re-delivers the whole batch. Replay must be absorbed without
/// duplicate audit or outbox rows, and the cursor must then advance.
#[tokio::test]
async fn redelivered_batch_is_absorbed_idempotently() -> anyhow::Result<()> {
    if std::env::var(tcap_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: TCAP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = tcap_db::testkit_db_pool().await?;

    let portfolio = Uuid::new_v4();
    let trades: Vec<Uuid> = (0..500).map(|_| Uuid::new_v4()).collect();

    let flow = RecordingFlow::new();
    let persister = BatchPersister::new(
        pool.clone(),
        CircuitSettings::default(),
        &IngestSettings::default(),
        flow.clone() as Arc<dyn FlowControl>,
    );

    // Redelivery carries byte-identical payloads, so build them once.
    let payloads: Vec<Vec<u8>> = trades
        .iter()
        .map(|trade| upstream_payload(portfolio, *trade, "VTI"))
        .collect();
    let make_batch = |cursor: Arc<MemoryCursor>| -> Vec<PendingMessage> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                pending_from_raw(
                    i as i64,
                    raw.clone(),
                    Some(cursor.clone() as Arc<dyn CursorStore>),
                )
            })
            .collect()
    };

    // First delivery lands; the "crash" loses the cursor advancement.
    let first_cursor = MemoryCursor::new();
    persister.run_batch(make_batch(Arc::clone(&first_cursor))).await?;
    assert_eq!(count_audit_for_portfolio(&pool, portfolio).await?, 500);
    assert_eq!(count_outbox(&pool, portfolio, None).await?, 500);

    // Restart: the stream re-delivers the same 500 messages.
    let second_cursor = MemoryCursor::new();
    persister.run_batch(make_batch(Arc::clone(&second_cursor))).await?;

    // Same row sets (at most one audit and one outbox row per trade_id),
    // and the cursor advanced past the replayed batch.
    assert_eq!(count_audit_for_portfolio(&pool, portfolio).await?, 500);
    assert_eq!(count_outbox(&pool, portfolio, None).await?, 500);
    assert_eq!(count_outbox(&pool, portfolio, Some("PENDING")).await?, 500);
    assert_eq!(second_cursor.last(), 499);
    Ok(())
}
