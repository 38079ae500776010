//! Production wiring: one value that owns the pool, the Kafka endpoints, and
//! the pipeline tasks, with an ordered shutdown.
//!
//! Construction threads every collaborator in explicitly: the ingest side
//! gets the consumer-backed flow control and cursor store, the dispatch side
//! gets the producer-backed sink. Nothing here is reachable from tests;
//! test wiring substitutes in-memory fakes at the same seams.

mod ingress;

pub use ingress::{build_consumer, run_ingress, KafkaFlow};

use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tcap_config::CaptureSettings;
use tcap_dispatch::{KafkaEventSink, OutboxDispatcher};
use tcap_ingest::{
    BatchPersister, BatchSink, FlowControl, IngestBuffer, Receiver, REPLAY_OFFSET,
};

struct TaskHandles {
    ingress: Option<JoinHandle<()>>,
    flush_timer: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

pub struct CaptureRuntime {
    consumer: Arc<StreamConsumer>,
    buffer: Arc<IngestBuffer>,
    receiver: Arc<Receiver>,
    stop_tx: watch::Sender<bool>,
    handles: tokio::sync::Mutex<TaskHandles>,
}

impl CaptureRuntime {
    /// Build and start the full pipeline: Kafka ingress → buffer → persister,
    /// plus the outbox dispatcher.
    pub async fn start(pool: PgPool, settings: &CaptureSettings) -> Result<Self> {
        let consumer = build_consumer(&settings.kafka)?;
        let flow: Arc<dyn FlowControl> = Arc::new(KafkaFlow::new(Arc::clone(&consumer)));

        let persister = Arc::new(BatchPersister::new(
            pool.clone(),
            settings.db.circuit.clone(),
            &settings.ingest,
            Arc::clone(&flow),
        ));
        let buffer = IngestBuffer::new(
            &settings.ingest,
            Arc::clone(&persister) as Arc<dyn BatchSink>,
            flow,
        );
        let receiver = Arc::new(Receiver::new(Arc::clone(&buffer)));

        let (stop_tx, stop_rx) = watch::channel(false);

        let flush_timer = buffer.spawn_flush_timer();
        let ingress = tokio::spawn(run_ingress(
            Arc::clone(&consumer),
            Arc::clone(&receiver),
            stop_rx.clone(),
        ));

        let sink = Arc::new(KafkaEventSink::from_settings(
            &settings.kafka,
            settings.outbox.kafka_send_timeout_ms,
        )?);
        let dispatcher = OutboxDispatcher::new(pool, sink, settings.outbox.clone());
        let dispatcher_handle = dispatcher.spawn(stop_rx);

        info!("trade-capture runtime started");
        Ok(CaptureRuntime {
            consumer,
            buffer,
            receiver,
            stop_tx,
            handles: tokio::sync::Mutex::new(TaskHandles {
                ingress: Some(ingress),
                flush_timer: Some(flush_timer),
                dispatcher: Some(dispatcher_handle),
            }),
        })
    }

    /// Admin replay hook: inject a hex-encoded payload as if it had arrived
    /// on the stream, with the sentinel offset and no broker context (so the
    /// persister skips cursor advancement for it).
    pub async fn replay_hex(&self, payload_hex: &str) -> Result<()> {
        let raw = hex::decode(payload_hex.trim()).context("replay payload is not valid hex")?;
        info!(bytes = raw.len(), "injecting replayed payload");
        self.receiver.on_delivery(REPLAY_OFFSET, raw, None).await;
        Ok(())
    }

    /// Ordered shutdown: stop the stream loop, drain what is buffered, then
    /// let the dispatcher finish its current iteration.
    pub async fn shutdown(&self) -> Result<()> {
        info!("trade-capture runtime stopping");
        let _ = self.stop_tx.send(true);

        let mut handles = self.handles.lock().await;
        if let Some(h) = handles.ingress.take() {
            let _ = h.await;
        }

        // No more deliveries: flush everything still in memory.
        self.buffer.shutdown().await?;
        if let Some(h) = handles.flush_timer.take() {
            let _ = h.await;
        }

        if let Some(h) = handles.dispatcher.take() {
            let _ = h.await;
        }

        // Flush stored offsets so a restart resumes exactly past the last
        // durable batch. An empty store is not an error worth failing on.
        if let Err(err) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %err, "final offset commit failed");
        }
        info!("trade-capture runtime stopped");
        Ok(())
    }
}
