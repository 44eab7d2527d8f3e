//! Periodic fetch → retry → deliver loop.
//!
//! The worker idles until the next tick, runs one cycle, and goes back to
//! waiting. Ticks that fire while a cycle is running are dropped, so cycles
//! never overlap. Cancellation is observed while idle and inside retry
//! backoff; an in-flight sink write always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingest::{DeliverySink, RecordSource};
use crate::metrics::Metrics;
use crate::retry::{run_with_retry, RetryError, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Delivered { key: String },
    Failed { key: String },
    FetchFailed,
    Idle,
    Cancelled,
}

pub struct DeliveryWorker {
    source: Box<dyn RecordSource>,
    sink: Arc<dyn DeliverySink>,
    policy: RetryPolicy,
    interval: Duration,
    metrics: Arc<Metrics>,
}

impl DeliveryWorker {
    pub fn new(
        source: Box<dyn RecordSource>,
        sink: Arc<dyn DeliverySink>,
        policy: RetryPolicy,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            sink,
            policy,
            interval,
            metrics,
        }
    }

    /// Runs until `cancel` fires. The first tick comes one interval after start.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs_f64(), "Delivery worker started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.run_cycle(&cancel).await == CycleOutcome::Cancelled {
                        break;
                    }
                }
            }
        }
        info!("Delivery worker stopped");
    }

    /// One fetch + deliver cycle. Holds nothing across calls.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        let record = match self.source.fetch_next().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Source had nothing to deliver");
                return CycleOutcome::Idle;
            }
            Err(e) => {
                warn!("Fetch failed: {:#}", e);
                self.metrics.record_ingest(false, None);
                return CycleOutcome::FetchFailed;
            }
        };

        let key = record.idempotency_key.clone();
        let sink = self.sink.clone();
        let start = Instant::now();
        let result = run_with_retry(self.policy, cancel, || sink.write(&record)).await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                debug!(key = %key, elapsed_secs = elapsed, "Delivered record");
                self.metrics.record_ingest(true, Some(elapsed));
                CycleOutcome::Delivered { key }
            }
            Err(RetryError::Cancelled) => {
                info!(key = %key, "Delivery abandoned on shutdown");
                CycleOutcome::Cancelled
            }
            Err(e) => {
                warn!(key = %key, "Ingest failed: {}", e);
                self.metrics.record_ingest(false, Some(elapsed));
                CycleOutcome::Failed { key }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{IngestRecord, MemorySink, SyntheticSource};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Sink that fails its first `failures` writes, then delegates to memory.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        inner: MemorySink,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                inner: MemorySink::new(),
            }
        }
    }

    #[async_trait]
    impl DeliverySink for FlakySink {
        async fn write(&self, record: &IngestRecord) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("connection reset");
            }
            self.inner.write(record).await
        }
    }

    /// Sink whose first write stalls for `stall`, logging when each write lands.
    struct StallingSink {
        stall: Duration,
        start: Instant,
        calls: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        landed_at: Mutex<Vec<u64>>,
    }

    impl StallingSink {
        fn new(stall: Duration) -> Self {
            Self {
                stall,
                start: Instant::now(),
                calls: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
                landed_at: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeliverySink for StallingSink {
        async fn write(&self, _record: &IngestRecord) -> Result<()> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.stall).await;
            }
            self.landed_at
                .lock()
                .unwrap()
                .push(self.start.elapsed().as_secs());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedSource {
        script: VecDeque<Result<Option<IngestRecord>>>,
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        async fn fetch_next(&mut self) -> Result<Option<IngestRecord>> {
            self.script.pop_front().unwrap_or(Ok(None))
        }
    }

    fn worker(
        source: Box<dyn RecordSource>,
        sink: Arc<dyn DeliverySink>,
    ) -> (DeliveryWorker, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        (
            DeliveryWorker::new(
                source,
                sink,
                RetryPolicy::DEFAULT,
                Duration::from_secs(30),
                metrics.clone(),
            ),
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_retries_until_delivered() {
        let sink = Arc::new(FlakySink::new(2));
        let (mut worker, metrics) = worker(Box::new(SyntheticSource::new("1")), sink.clone());

        let outcome = worker.run_cycle(&CancellationToken::new()).await;

        assert_eq!(
            outcome,
            CycleOutcome::Delivered {
                key: "1-0".to_string()
            }
        );
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.inner.len(), 1);
        assert_eq!(metrics.ingest_count("ok"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delivery_is_counted_and_next_cycle_proceeds() {
        let sink = Arc::new(FlakySink::new(3));
        let (mut worker, metrics) = worker(Box::new(SyntheticSource::new("1")), sink.clone());
        let cancel = CancellationToken::new();

        let first = worker.run_cycle(&cancel).await;
        let second = worker.run_cycle(&cancel).await;

        assert_eq!(
            first,
            CycleOutcome::Failed {
                key: "1-0".to_string()
            }
        );
        assert_eq!(
            second,
            CycleOutcome::Delivered {
                key: "1-1".to_string()
            }
        );
        assert_eq!(metrics.ingest_count("error"), 1);
        assert_eq!(metrics.ingest_count("ok"), 1);
    }

    #[tokio::test]
    async fn fetch_error_skips_delivery() {
        let source = ScriptedSource {
            script: VecDeque::from([Err(anyhow::anyhow!("rpc down"))]),
        };
        let sink = Arc::new(FlakySink::new(0));
        let (mut worker, metrics) = worker(Box::new(source), sink.clone());
        let cancel = CancellationToken::new();

        assert_eq!(worker.run_cycle(&cancel).await, CycleOutcome::FetchFailed);
        assert_eq!(worker.run_cycle(&cancel).await, CycleOutcome::Idle);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.ingest_count("error"), 1);
        assert_eq!(metrics.ingest_count("ok"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_key_leaves_one_entry() {
        let record = IngestRecord {
            idempotency_key: "chain1-42".to_string(),
            chain_id: "chain1".to_string(),
            block_number: 42,
            payload: serde_json::json!({"block": 42}),
        };
        let source = ScriptedSource {
            script: VecDeque::from([Ok(Some(record.clone())), Ok(Some(record))]),
        };
        let sink = Arc::new(MemorySink::new());
        let (mut worker, _metrics) = worker(Box::new(source), sink.clone());
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            assert!(matches!(
                worker.run_cycle(&cancel).await,
                CycleOutcome::Delivered { .. }
            ));
        }
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_delivers_on_each_tick_and_stops_on_cancel() {
        let sink = Arc::new(MemorySink::new());
        let (worker, metrics) = worker(Box::new(SyntheticSource::new("1")), sink.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        // Ticks at 30s, 60s and 90s.
        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.len(), 3);
        assert!(sink.get("1-2").is_some());
        assert_eq!(metrics.ingest_count("ok"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycle_skips_missed_ticks() {
        let sink = Arc::new(StallingSink::new(Duration::from_secs(100)));
        let (worker, metrics) = worker(Box::new(SyntheticSource::new("1")), sink.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        // Ticks due at 30s..210s: seven of them. The first cycle holds the
        // worker until 130s, so the 60s, 90s and 120s ticks collapse into
        // one late tick and the schedule resumes at 150s.
        tokio::time::sleep(Duration::from_secs(215)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*sink.landed_at.lock().unwrap(), vec![130, 130, 150, 180, 210]);
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.ingest_count("ok"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_exits_without_counting_failure() {
        let sink = Arc::new(FlakySink::new(u32::MAX));
        let (worker, metrics) = worker(Box::new(SyntheticSource::new("1")), sink.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        // First tick at 30s, first failure, then a 1s backoff.
        tokio::time::sleep(Duration::from_millis(30_500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.ingest_count("error"), 0);
    }
}
