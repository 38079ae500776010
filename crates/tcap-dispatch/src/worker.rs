//! Per-batch dispatch worker and failure classifier.
//!
//! Events go out one at a time, in order, and the worker stops at the first
//! failure. The returned prefix is the only thing the dispatcher may mark
//! SENT; that is what keeps per-portfolio order strict across retries and
//! across processes.
//!
//! Classification is deliberately conservative: only precisely enumerated
//! conditions are poison, everything unrecognized is a system failure. A
//! poison misread as system stalls one portfolio; a system failure misread
//! as poison loses data.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use tcap_db::OutboxRow;

/// How a downstream send failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The event will never be accepted, no matter how often it is retried.
    Poison(String),
    /// Transient: timeouts, connectivity, leadership churn. Retry later.
    System(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Poison(reason) => write!(f, "poison: {reason}"),
            SinkError::System(reason) => write!(f, "system failure: {reason}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// The downstream log. Sends are keyed by portfolio so same-portfolio events
/// land on one partition; implementations must resolve within `timeout` or
/// report a system failure.
pub trait EventSink: Send + Sync {
    fn send<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), SinkError>>;
}

#[derive(Debug, Clone)]
pub struct PoisonPill {
    pub outbox_id: i64,
    pub reason: String,
}

/// Outcome of one portfolio group: the successful prefix, at most one poison
/// pill, and whether a system failure stopped the group.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub successful_ids: Vec<i64>,
    pub poison: Option<PoisonPill>,
    pub system_failure: bool,
}

pub struct DispatchWorker<S> {
    sink: Arc<S>,
    send_timeout: Duration,
}

impl<S: EventSink> DispatchWorker<S> {
    pub fn new(sink: Arc<S>, send_timeout: Duration) -> Self {
        DispatchWorker { sink, send_timeout }
    }

    /// Send one portfolio group in order, stopping at the first failure.
    pub async fn process_group(&self, group: &[OutboxRow]) -> BatchResult {
        let mut successful_ids = Vec::with_capacity(group.len());

        for row in group {
            // Local poison check: a payload that no longer parses as a trade
            // event is quarantined without contacting the downstream log.
            if let Err(err) = tcap_schemas::decode_event(&row.payload) {
                return BatchResult {
                    successful_ids,
                    poison: Some(PoisonPill {
                        outbox_id: row.outbox_id,
                        reason: format!("invalid payload: {err}"),
                    }),
                    system_failure: false,
                };
            }

            let key = row.portfolio_id.to_string();
            match self.sink.send(&key, &row.payload, self.send_timeout).await {
                Ok(()) => {
                    debug!(outbox_id = row.outbox_id, trade_id = %row.trade_id, "event dispatched");
                    successful_ids.push(row.outbox_id);
                }
                Err(SinkError::Poison(reason)) => {
                    warn!(outbox_id = row.outbox_id, %reason, "poison event detected");
                    return BatchResult {
                        successful_ids,
                        poison: Some(PoisonPill {
                            outbox_id: row.outbox_id,
                            reason,
                        }),
                        system_failure: false,
                    };
                }
                Err(SinkError::System(reason)) => {
                    warn!(outbox_id = row.outbox_id, %reason, "downstream system failure");
                    return BatchResult {
                        successful_ids,
                        poison: None,
                        system_failure: true,
                    };
                }
            }
        }

        BatchResult {
            successful_ids,
            poison: None,
            system_failure: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct ScriptedSink {
        script: Mutex<VecDeque<Result<(), SinkError>>>,
    }

    impl ScriptedSink {
        fn new(script: Vec<Result<(), SinkError>>) -> Arc<Self> {
            Arc::new(ScriptedSink {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl EventSink for ScriptedSink {
        fn send<'a>(
            &'a self,
            _key: &'a str,
            _payload: &'a [u8],
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<(), SinkError>> {
            Box::pin(async move {
                self.script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Ok(()))
            })
        }
    }

    fn row(outbox_id: i64, payload: Vec<u8>) -> OutboxRow {
        OutboxRow {
            outbox_id,
            created_at: chrono::Utc::now(),
            portfolio_id: Uuid::new_v4(),
            trade_id: Uuid::new_v4(),
            payload,
            status: "PENDING".to_string(),
            attempts: 0,
            sent_at: None,
        }
    }

    fn event_payload() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "tradeId": Uuid::new_v4(),
            "portfolioId": Uuid::new_v4(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn all_success_returns_full_prefix() {
        let sink = ScriptedSink::new(vec![Ok(()), Ok(()), Ok(())]);
        let worker = DispatchWorker::new(sink, Duration::from_secs(1));
        let group = vec![
            row(1, event_payload()),
            row(2, event_payload()),
            row(3, event_payload()),
        ];
        let res = worker.process_group(&group).await;
        assert_eq!(res.successful_ids, vec![1, 2, 3]);
        assert!(res.poison.is_none());
        assert!(!res.system_failure);
    }

    #[tokio::test]
    async fn undecodable_payload_is_poison_without_send() {
        let sink = ScriptedSink::new(vec![Ok(())]);
        let worker = DispatchWorker::new(sink.clone(), Duration::from_secs(1));
        let group = vec![row(1, event_payload()), row(2, b"garbage".to_vec())];
        let res = worker.process_group(&group).await;
        assert_eq!(res.successful_ids, vec![1]);
        let pill = res.poison.expect("expected poison");
        assert_eq!(pill.outbox_id, 2);
        assert!(!res.system_failure);
        // The poison event never reached the sink.
        assert_eq!(sink.script.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn system_failure_stops_at_prefix() {
        let sink = ScriptedSink::new(vec![
            Ok(()),
            Err(SinkError::System("timeout".to_string())),
            Ok(()),
        ]);
        let worker = DispatchWorker::new(sink, Duration::from_secs(1));
        let group = vec![
            row(1, event_payload()),
            row(2, event_payload()),
            row(3, event_payload()),
        ];
        let res = worker.process_group(&group).await;
        assert_eq!(res.successful_ids, vec![1]);
        assert!(res.poison.is_none());
        assert!(res.system_failure);
    }

    #[tokio::test]
    async fn sink_poison_carries_offender() {
        let sink = ScriptedSink::new(vec![Err(SinkError::Poison("record too large".to_string()))]);
        let worker = DispatchWorker::new(sink, Duration::from_secs(1));
        let group = vec![row(9, event_payload())];
        let res = worker.process_group(&group).await;
        assert!(res.successful_ids.is_empty());
        assert_eq!(res.poison.unwrap().outbox_id, 9);
    }
}
