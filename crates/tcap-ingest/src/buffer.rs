//! Bounded in-memory queue between the receiver and the persister.
//!
//! Messages enter and leave in strict offset order. The queue lock is held
//! only to mutate the queue; the slow persist call runs outside it, under a
//! separate flush lock that keeps batches sequential.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use tcap_config::IngestSettings;

use crate::types::{BatchSink, FlowControl, PendingMessage};

pub struct IngestBuffer {
    queue: Mutex<VecDeque<PendingMessage>>,
    /// Signalled whenever a drain frees space; wakes blocked `add` callers.
    space: Notify,
    /// Serializes flushes so drained batches reach the sink in offset order.
    flush_lock: tokio::sync::Mutex<()>,
    last_flush: Mutex<Instant>,
    sink: Arc<dyn BatchSink>,
    flow: Arc<dyn FlowControl>,
    capacity: usize,
    resume_threshold: usize,
    max_batch: usize,
    flush_interval_ms: u64,
    stopped: AtomicBool,
}

impl IngestBuffer {
    pub fn new(
        settings: &IngestSettings,
        sink: Arc<dyn BatchSink>,
        flow: Arc<dyn FlowControl>,
    ) -> Arc<Self> {
        Arc::new(IngestBuffer {
            queue: Mutex::new(VecDeque::with_capacity(settings.buffer.capacity.min(4096))),
            space: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            sink,
            flow,
            capacity: settings.buffer.capacity,
            resume_threshold: settings.buffer.resume_threshold(),
            max_batch: settings.batch.max_size,
            flush_interval_ms: settings.batch.flush_interval_ms,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("buffer mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one message.
    ///
    /// Fast path is non-blocking. When the buffer is full this pauses the
    /// stream and parks the caller until a flush frees space; it never
    /// drops and never reorders. Fails only during shutdown, in which case
    /// the message was not enqueued and redelivery is expected.
    pub async fn add(&self, msg: PendingMessage) -> Result<()> {
        let mut slot = Some(msg);
        let len = loop {
            if self.stopped.load(Ordering::Acquire) {
                bail!("ingest buffer is shutting down");
            }
            let notified = self.space.notified();
            {
                let mut q = self.queue.lock().expect("buffer mutex poisoned");
                if q.len() < self.capacity {
                    if let Some(m) = slot.take() {
                        q.push_back(m);
                    }
                    break q.len();
                }
            }
            self.flow.pause();
            debug!(capacity = self.capacity, "ingest buffer full; stream paused");
            notified.await;
        };

        if len >= self.max_batch {
            self.flush().await?;
        }
        Ok(())
    }

    /// Drain up to `max_batch` messages in offset order and hand them to the
    /// sink. Concurrent callers queue on the flush lock, so batch N+1 is
    /// never submitted before batch N returns.
    pub async fn flush(&self) -> Result<()> {
        let _serial = self.flush_lock.lock().await;

        let batch: Vec<PendingMessage> = {
            let mut q = self.queue.lock().expect("buffer mutex poisoned");
            let n = q.len().min(self.max_batch);
            q.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        *self.last_flush.lock().expect("buffer mutex poisoned") = Instant::now();
        self.space.notify_waiters();

        self.sink.run_batch(batch).await?;

        // Below the low-water mark the stream may flow again. Resume is
        // idempotent, so no paused-state bookkeeping is needed.
        if self.len() < self.resume_threshold {
            self.flow.resume();
        }
        Ok(())
    }

    /// Periodic watchdog: ticks at half the flush interval and flushes
    /// whenever the queue is non-empty and the last flush is older than the
    /// interval.
    pub fn spawn_flush_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let buf = Arc::clone(self);
        tokio::spawn(async move {
            let tick = std::time::Duration::from_millis((buf.flush_interval_ms / 2).max(1));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if buf.stopped.load(Ordering::Acquire) {
                    return;
                }
                let due = {
                    let last = *buf.last_flush.lock().expect("buffer mutex poisoned");
                    last.elapsed().as_millis() as u64 >= buf.flush_interval_ms
                };
                if due && !buf.is_empty() {
                    if let Err(err) = buf.flush().await {
                        error!(error = format!("{err:#}"), "timed flush failed");
                    }
                }
            }
        })
    }

    /// Stop accepting input and drain everything that is still in memory.
    /// Called after the stream loop has stopped delivering.
    pub async fn shutdown(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        self.space.notify_waiters();
        while !self.is_empty() {
            self.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageBody;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct RecordingSink {
        batches: Mutex<Vec<Vec<i64>>>,
        delay_ms: u64,
    }

    impl RecordingSink {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(RecordingSink {
                batches: Mutex::new(Vec::new()),
                delay_ms,
            })
        }

        fn offsets(&self) -> Vec<Vec<i64>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl BatchSink for RecordingSink {
        fn run_batch<'a>(&'a self, batch: Vec<PendingMessage>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                if self.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
                }
                self.batches
                    .lock()
                    .unwrap()
                    .push(batch.iter().map(|m| m.offset).collect());
                Ok(())
            })
        }
    }

    #[derive(Default)]
    struct CountingFlow {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl FlowControl for CountingFlow {
        fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn msg(offset: i64) -> PendingMessage {
        PendingMessage {
            offset,
            raw: Vec::new(),
            body: MessageBody::Invalid {
                error: "test".to_string(),
            },
            cursor: None,
        }
    }

    fn settings(capacity: usize, max_batch: usize) -> IngestSettings {
        let mut s = IngestSettings::default();
        s.buffer = serde_json::from_value(serde_json::json!({ "capacity": capacity })).unwrap();
        s.batch.max_size = max_batch;
        s
    }

    #[tokio::test]
    async fn size_threshold_flushes_in_offset_order() {
        let sink = RecordingSink::new(0);
        let flow = Arc::new(CountingFlow::default());
        let buf = IngestBuffer::new(&settings(1000, 5), sink.clone(), flow);

        for i in 0..12 {
            buf.add(msg(i)).await.unwrap();
        }
        buf.flush().await.unwrap();

        let batches = sink.offsets();
        let flat: Vec<i64> = batches.iter().flatten().copied().collect();
        assert_eq!(flat, (0..12).collect::<Vec<_>>());
        assert!(batches.iter().all(|b| b.len() <= 5));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn full_buffer_pauses_then_resumes_after_drain() {
        let sink = RecordingSink::new(20);
        let flow = Arc::new(CountingFlow::default());
        // max_batch larger than capacity so only explicit flushes drain.
        let mut s = settings(1000, 100);
        s.buffer = serde_json::from_value(
            serde_json::json!({ "capacity": 4, "resume-threshold": 2 }),
        )
        .unwrap();
        let buf = IngestBuffer::new(&s, sink.clone(), flow.clone());

        for i in 0..4 {
            buf.add(msg(i)).await.unwrap();
        }

        // Buffer is at capacity: the next add must pause the stream and park.
        let blocked = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.add(msg(4)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(flow.pauses.load(Ordering::SeqCst) >= 1);
        assert_eq!(buf.len(), 4);

        buf.flush().await.unwrap();
        blocked.await.unwrap().unwrap();
        buf.flush().await.unwrap();
        assert!(flow.resumes.load(Ordering::SeqCst) >= 1);

        let flat: Vec<i64> = sink.offsets().into_iter().flatten().collect();
        assert_eq!(flat, (0..5).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_messages() {
        let sink = RecordingSink::new(0);
        let flow = Arc::new(CountingFlow::default());
        let buf = IngestBuffer::new(&settings(1000, 10), sink.clone(), flow);

        for i in 0..7 {
            buf.add(msg(i)).await.unwrap();
        }
        buf.shutdown().await.unwrap();

        let flat: Vec<i64> = sink.offsets().into_iter().flatten().collect();
        assert_eq!(flat, (0..7).collect::<Vec<_>>());
        assert!(buf.add(msg(99)).await.is_err());
    }
}
