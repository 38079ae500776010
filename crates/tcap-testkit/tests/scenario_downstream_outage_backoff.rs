use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use tcap_dispatch::{OutboxDispatcher, SinkError};
use tcap_testkit::{
    count_outbox, event_payload, seed_outbox_row, wide_outbox_settings, MemorySink,
};

/// Three scripted downstream timeouts, then recovery. The successful prefix
/// stays empty, nothing is skipped, and backoff escalates 1000 → 2000 → 4000
/// before clearing on the first healthy iteration.
#[tokio::test]
async fn transient_outage_escalates_backoff_then_recovers() -> anyhow::Result<()> {
    if std::env::var(tcap_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: TCAP_DATABASE_URL not set");
        return Ok(());
    }
    let pool = tcap_db::testkit_db_pool().await?;

    let portfolio = Uuid::new_v4();
    let t1 = Uuid::new_v4();
    let t2 = Uuid::new_v4();
    let base = Utc::now();
    seed_outbox_row(&pool, portfolio, t1, &event_payload(portfolio, t1), base).await?;
    seed_outbox_row(
        &pool,
        portfolio,
        t2,
        &event_payload(portfolio, t2),
        base + ChronoDuration::milliseconds(1),
    )
    .await?;

    let sink = MemorySink::new();
    sink.fail_next_for_key(
        &portfolio.to_string(),
        SinkError::System("injected ack timeout".to_string()),
        3,
    );
    let dispatcher = OutboxDispatcher::new(pool.clone(), sink.clone(), wide_outbox_settings());

    for expected_backoff in [1_000, 2_000, 4_000] {
        let head_before = tcap_db::first_pending_for_portfolio(&pool, portfolio)
            .await?
            .expect("head row present");
        dispatcher.run_iteration().await?;
        assert_eq!(dispatcher.current_backoff_ms(), expected_backoff);
        // Prefix safety: nothing marked, nothing skipped.
        assert_eq!(count_outbox(&pool, portfolio, Some("SENT")).await?, 0);
        let head_after = tcap_db::first_pending_for_portfolio(&pool, portfolio)
            .await?
            .expect("head row still present");
        assert_eq!(head_before.trade_id, head_after.trade_id);
        assert_eq!(head_after.trade_id, t1);
    }

    // Fourth iteration: the downstream is healthy again.
    for _ in 0..10 {
        dispatcher.run_iteration().await?;
        if count_outbox(&pool, portfolio, Some("SENT")).await? == 2 {
            break;
        }
    }
    assert_eq!(count_outbox(&pool, portfolio, Some("SENT")).await?, 2);
    assert_eq!(dispatcher.current_backoff_ms(), 0);

    let received: Vec<Uuid> = sink
        .payloads_for_key(&portfolio.to_string())
        .iter()
        .map(|p| tcap_schemas::decode_event(p).expect("delivered payload decodes").trade_id)
        .collect();
    assert_eq!(received, vec![t1, t2]);
    Ok(())
}
