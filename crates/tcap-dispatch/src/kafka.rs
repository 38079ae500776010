//! Kafka binding of [`EventSink`].
//!
//! Payload bytes are produced verbatim with the portfolio id as partition
//! key, so same-portfolio events share a partition and keep their order.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;

use tcap_config::KafkaSettings;

use crate::worker::{EventSink, SinkError};

pub struct KafkaEventSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventSink {
    pub fn from_settings(kafka: &KafkaSettings, send_timeout_ms: u64) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.brokers)
            .set("client.id", "trade-capture-dispatcher")
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", send_timeout_ms.to_string())
            .create()
            .context("create Kafka producer")?;

        Ok(KafkaEventSink {
            producer,
            topic: kafka.sink_topic.clone(),
        })
    }
}

impl EventSink for KafkaEventSink {
    fn send<'a>(
        &'a self,
        key: &'a str,
        payload: &'a [u8],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let record = FutureRecord::to(&self.topic).key(key).payload(payload);
            let delivery = tokio::time::timeout(timeout, self.producer.send(record, timeout)).await;
            match delivery {
                Err(_) => Err(SinkError::System(format!(
                    "no broker acknowledgement within {}ms",
                    timeout.as_millis()
                ))),
                Ok(Ok(_)) => Ok(()),
                Ok(Err((err, _msg))) => Err(classify(err)),
            }
        })
    }
}

/// Map a producer error onto the poison/system split.
///
/// Only conditions the broker will report identically on every retry are
/// poison. Payload decode errors are caught by the worker before the send,
/// and null key/value cannot occur with these argument types, so the
/// remaining poison class is the broker-side message rejections below.
/// Everything unrecognized is a system failure on purpose.
fn classify(err: KafkaError) -> SinkError {
    match &err {
        KafkaError::MessageProduction(code) => match code {
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidRecord => SinkError::Poison(err.to_string()),
            _ => SinkError::System(err.to_string()),
        },
        _ => SinkError::System(err.to_string()),
    }
}
