//! Typed view of the capture config tree.
//!
//! Keys are kebab-case to match the YAML files operators write; every field
//! carries the documented default so a missing section means "defaults", not
//! an error.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CaptureSettings {
    pub ingest: IngestSettings,
    pub db: DbSettings,
    pub outbox: OutboxSettings,
    pub kafka: KafkaSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IngestSettings {
    pub batch: FlushSettings,
    pub buffer: BufferSettings,
    /// Fixed sleep before retrying a batch that hit an open circuit.
    pub db_retry_backoff_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            batch: FlushSettings::default(),
            buffer: BufferSettings::default(),
            db_retry_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlushSettings {
    /// Upper bound on items drained per flush.
    pub max_size: usize,
    /// Time-based flush cadence; the watchdog ticks at half this interval.
    pub flush_interval_ms: u64,
}

impl Default for FlushSettings {
    fn default() -> Self {
        FlushSettings {
            max_size: 500,
            flush_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BufferSettings {
    /// Hard upper bound on in-flight messages.
    pub capacity: usize,
    /// Buffer level at which the paused stream is resumed.
    /// Defaults to capacity / 10 when not set explicitly.
    resume_threshold: Option<usize>,
}

impl BufferSettings {
    pub fn resume_threshold(&self) -> usize {
        self.resume_threshold.unwrap_or(self.capacity / 10)
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            capacity: 10_000,
            resume_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DbSettings {
    pub circuit: CircuitSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CircuitSettings {
    /// Failure share of the sliding window that trips the breaker.
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the rate is evaluated.
    pub minimum_calls: u32,
    /// Sliding window size, in calls.
    pub window_size: u32,
    /// How long the breaker stays open before probing.
    pub open_duration_ms: u64,
    /// Trial calls admitted in half-open state.
    pub half_open_calls: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        CircuitSettings {
            failure_rate_threshold: 0.5,
            minimum_calls: 10,
            window_size: 20,
            open_duration_ms: 10_000,
            half_open_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutboxSettings {
    pub min_batch: i64,
    pub max_batch: i64,
    pub target_latency_ms: u64,
    pub system_failure_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub idle_sleep_ms: u64,
    pub kafka_send_timeout_ms: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        OutboxSettings {
            min_batch: 10,
            max_batch: 2_000,
            target_latency_ms: 200,
            system_failure_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            idle_sleep_ms: 50,
            kafka_send_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KafkaSettings {
    pub brokers: String,
    /// Upstream trade stream.
    pub source_topic: String,
    pub group_id: String,
    /// Downstream trade-event log.
    pub sink_topic: String,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        KafkaSettings {
            brokers: "localhost:9092".to_string(),
            source_topic: "trades.raw.v1".to_string(),
            group_id: "trade-capture".to_string(),
            sink_topic: "trades.events.v1".to_string(),
        }
    }
}
