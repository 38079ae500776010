use std::sync::Arc;

use uuid::Uuid;

use tcap_config::{CircuitSettings, IngestSettings};
use tcap_dispatch::OutboxDispatcher;
use tcap_ingest::{BatchPersister, CursorStore, FlowControl, PendingMessage};
use tcap_testkit::{
    count_outbox, dlq_count_containing, pending_from_raw, upstream_payload, wide_outbox_settings,
    MemoryCursor, MemorySink, RecordingFlow,
};

#[tokio::test]
async fn five_trades_flow_through_in_order() -> anyhow::Result<()> {
    // Skip if no DB configured.
    if std::env::var(tcap_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: TCAP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = tcap_db::testkit_db_pool().await?;

    let portfolio = Uuid::new_v4();
    let trades: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

    // Ingest one ordered batch of five valid trades.
    let flow = RecordingFlow::new();
    let cursor = MemoryCursor::new();
    let persister = BatchPersister::new(
        pool.clone(),
        CircuitSettings::default(),
        &IngestSettings::default(),
        flow.clone() as Arc<dyn FlowControl>,
    );
    let batch: Vec<PendingMessage> = trades
        .iter()
        .enumerate()
        .map(|(i, trade)| {
            pending_from_raw(
                i as i64,
                upstream_payload(portfolio, *trade, "SPY"),
                Some(cursor.clone() as Arc<dyn CursorStore>),
            )
        })
        .collect();
    persister.run_batch(batch).await?;

    assert_eq!(cursor.last(), 4, "cursor advances to the batch's last offset");
    assert_eq!(count_outbox(&pool, portfolio, Some("PENDING")).await?, 5);

    // Dispatch until all five are SENT.
    let sink = MemorySink::new();
    let dispatcher = OutboxDispatcher::new(pool.clone(), sink.clone(), wide_outbox_settings());
    for _ in 0..50 {
        dispatcher.run_iteration().await?;
        if count_outbox(&pool, portfolio, Some("SENT")).await? == 5 {
            break;
        }
    }
    assert_eq!(count_outbox(&pool, portfolio, Some("SENT")).await?, 5);
    assert_eq!(count_outbox(&pool, portfolio, Some("PENDING")).await?, 0);

    // Downstream partition for this portfolio received T1..T5 in order.
    let payloads = sink.payloads_for_key(&portfolio.to_string());
    let received: Vec<Uuid> = payloads
        .iter()
        .map(|p| tcap_schemas::decode_event(p).expect("delivered payload decodes").trade_id)
        .collect();
    assert_eq!(received, trades);

    // The delivered bytes are the stored bytes, verbatim.
    let row = tcap_db::fetch_outbox_by_trade_id(&pool, trades[0])
        .await?
        .expect("outbox row for first trade");
    assert_eq!(payloads[0], row.payload);

    // SENT order in the database matches ingest order.
    assert_eq!(
        tcap_db::sent_trade_ids_for_portfolio(&pool, portfolio).await?,
        trades
    );

    // Nothing of ours reached the DLQ.
    for trade in &trades {
        assert_eq!(
            dlq_count_containing(&pool, trade.to_string().as_bytes()).await?,
            0
        );
    }
    Ok(())
}
