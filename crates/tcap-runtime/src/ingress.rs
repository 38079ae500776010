//! Kafka side of the ingest loop.
//!
//! The consumer runs with `enable.auto.offset.store=false`: the pipeline
//! decides when an offset is safe by calling [`CursorStore::advance`], which
//! stores `offset + 1`; librdkafka's auto-commit then flushes stored offsets
//! in the background. Pausing and resuming the assignment is the consumer's
//! backpressure lever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tcap_config::KafkaSettings;
use tcap_ingest::{CursorStore, FlowControl, Receiver};

pub fn build_consumer(kafka: &KafkaSettings) -> Result<Arc<StreamConsumer>> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", &kafka.group_id)
        .set("bootstrap.servers", &kafka.brokers)
        .set("client.id", "trade-capture-ingest")
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "6000")
        .create()
        .context("create Kafka consumer")?;

    consumer
        .subscribe(&[&kafka.source_topic])
        .with_context(|| format!("subscribe to {}", kafka.source_topic))?;

    info!(
        brokers = %kafka.brokers,
        topic = %kafka.source_topic,
        group = %kafka.group_id,
        "trade stream consumer initialized"
    );
    Ok(Arc::new(consumer))
}

/// Backpressure against the whole current assignment.
pub struct KafkaFlow {
    consumer: Arc<StreamConsumer>,
}

impl KafkaFlow {
    pub fn new(consumer: Arc<StreamConsumer>) -> Self {
        KafkaFlow { consumer }
    }
}

impl FlowControl for KafkaFlow {
    fn pause(&self) {
        match self.consumer.assignment() {
            Ok(assignment) => {
                if let Err(err) = self.consumer.pause(&assignment) {
                    warn!(error = %err, "failed to pause consumer assignment");
                }
            }
            Err(err) => warn!(error = %err, "failed to read consumer assignment for pause"),
        }
    }

    fn resume(&self) {
        match self.consumer.assignment() {
            Ok(assignment) => {
                if let Err(err) = self.consumer.resume(&assignment) {
                    warn!(error = %err, "failed to resume consumer assignment");
                }
            }
            Err(err) => warn!(error = %err, "failed to read consumer assignment for resume"),
        }
    }
}

/// Cursor for one `(topic, partition)` pair.
struct KafkaCursor {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
}

impl CursorStore for KafkaCursor {
    fn advance(&self, offset: i64) -> Result<()> {
        // Store the next offset to consume; everything up to and including
        // `offset` is durable by the time the persister calls this.
        self.consumer
            .store_offset(&self.topic, self.partition, offset + 1)
            .with_context(|| {
                format!("store offset {} for {}[{}]", offset + 1, self.topic, self.partition)
            })
    }
}

/// Delivery loop: translate each Kafka message into a receiver delivery.
/// Honors the stop flag between messages; receive errors are logged and
/// retried, never propagated (an exiting loop would halt ingestion).
pub async fn run_ingress(
    consumer: Arc<StreamConsumer>,
    receiver: Arc<Receiver>,
    mut stop: watch::Receiver<bool>,
) {
    let mut cursors: HashMap<(String, i32), Arc<KafkaCursor>> = HashMap::new();
    info!("trade stream ingress started");
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            delivery = consumer.recv() => match delivery {
                Ok(msg) => {
                    let topic = msg.topic().to_string();
                    let partition = msg.partition();
                    let cursor = cursors
                        .entry((topic.clone(), partition))
                        .or_insert_with(|| {
                            Arc::new(KafkaCursor {
                                consumer: Arc::clone(&consumer),
                                topic,
                                partition,
                            })
                        })
                        .clone();

                    let offset = msg.offset();
                    let raw = msg.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    // Release the borrowed message before the (potentially
                    // blocking) hand-off to the buffer.
                    drop(msg);
                    debug!(offset, partition, "trade message received");
                    receiver
                        .on_delivery(offset, raw, Some(cursor as Arc<dyn CursorStore>))
                        .await;
                }
                Err(err) => {
                    warn!(error = %err, "stream receive error; retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
    info!("trade stream ingress stopped");
}
