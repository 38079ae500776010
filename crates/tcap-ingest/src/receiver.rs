use std::sync::Arc;

use tracing::{debug, warn};

use tcap_schemas::decode_trade;

use crate::buffer::IngestBuffer;
use crate::types::{CursorStore, MessageBody, PendingMessage};

/// Translates broker deliveries into [`PendingMessage`]s.
///
/// Decode and validation failures are downgraded to invalid messages with
/// the raw bytes preserved. Nothing here may error back at the stream loop,
/// because a propagated error would halt delivery for the whole partition.
/// Cursor commitment is the persister's decision, never taken here.
pub struct Receiver {
    buffer: Arc<IngestBuffer>,
}

impl Receiver {
    pub fn new(buffer: Arc<IngestBuffer>) -> Self {
        Receiver { buffer }
    }

    /// Handle one delivery. Blocks only while the buffer applies
    /// backpressure.
    pub async fn on_delivery(
        &self,
        offset: i64,
        raw: Vec<u8>,
        cursor: Option<Arc<dyn CursorStore>>,
    ) {
        let body = match decode_trade(&raw) {
            Ok(trade) => MessageBody::Valid(trade),
            Err(err) => {
                debug!(offset, error = %err, "undecodable trade message routed as invalid");
                MessageBody::Invalid {
                    error: err.to_string(),
                }
            }
        };

        let msg = PendingMessage {
            offset,
            raw,
            body,
            cursor,
        };

        if let Err(err) = self.buffer.add(msg).await {
            // Only reachable during shutdown. The cursor was never advanced
            // for this offset, so the broker will redeliver it.
            warn!(offset, error = format!("{err:#}"), "delivery not buffered; redelivery expected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchSink, FlowControl};
    use anyhow::Result;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;

    struct CaptureSink {
        batches: Mutex<Vec<Vec<PendingMessage>>>,
    }

    impl BatchSink for CaptureSink {
        fn run_batch<'a>(&'a self, batch: Vec<PendingMessage>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.batches.lock().unwrap().push(batch);
                Ok(())
            })
        }
    }

    struct NoFlow;
    impl FlowControl for NoFlow {
        fn pause(&self) {}
        fn resume(&self) {}
    }

    #[tokio::test]
    async fn undecodable_delivery_becomes_invalid_message() {
        let sink = Arc::new(CaptureSink {
            batches: Mutex::new(Vec::new()),
        });
        let buf = IngestBuffer::new(
            &tcap_config::IngestSettings::default(),
            sink.clone(),
            Arc::new(NoFlow),
        );
        let rx = Receiver::new(Arc::clone(&buf));

        rx.on_delivery(7, b"{broken".to_vec(), None).await;
        buf.flush().await.unwrap();

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let msg = &batches[0][0];
        assert_eq!(msg.offset, 7);
        assert!(!msg.is_valid());
        assert_eq!(msg.raw, b"{broken".to_vec());
    }

    #[tokio::test]
    async fn valid_delivery_keeps_decoded_trade() {
        let sink = Arc::new(CaptureSink {
            batches: Mutex::new(Vec::new()),
        });
        let buf = IngestBuffer::new(
            &tcap_config::IngestSettings::default(),
            sink.clone(),
            Arc::new(NoFlow),
        );
        let rx = Receiver::new(Arc::clone(&buf));

        let portfolio = uuid::Uuid::new_v4();
        let trade = uuid::Uuid::new_v4();
        let raw = serde_json::to_vec(&serde_json::json!({
            "portfolioId": portfolio,
            "tradeId": trade,
            "symbol": "QQQ",
            "side": "SELL",
            "quantity": 3
        }))
        .unwrap();

        rx.on_delivery(42, raw, None).await;
        buf.flush().await.unwrap();

        let batches = sink.batches.lock().unwrap();
        match &batches[0][0].body {
            MessageBody::Valid(t) => {
                assert_eq!(t.portfolio_id, portfolio);
                assert_eq!(t.trade_id, trade);
            }
            MessageBody::Invalid { error } => panic!("expected valid, got invalid: {error}"),
        }
    }
}
