//! Worker pool draining the batch channel into a sink.
//!
//! All workers share one receiver. Each loops until the channel is closed or
//! the run is cancelled, posting every batch it receives. A failed post is
//! logged and counted; the worker moves on to the next batch. On cancellation
//! the receiver is closed so a waiting producer is released, and batches still
//! queued are counted as abandoned when the pool is joined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::LogSink;
use crate::record::LogBatch;

/// Delivery statistics of one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Batches accepted by the sink
    pub batches_sent: u64,

    /// Batches the sink failed on
    pub batches_failed: u64,

    /// Records inside accepted batches
    pub records_sent: u64,

    /// Records inside failed batches
    pub records_failed: u64,

    /// Batches left in the channel when the workers stopped
    pub batches_abandoned: u64,

    /// Records inside abandoned batches
    pub records_abandoned: u64,

    /// Workers that ended by panicking
    pub workers_panicked: u64,
}

#[derive(Default)]
struct Counters {
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    records_sent: AtomicU64,
    records_failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            batches_sent: self.batches_sent.load(Ordering::SeqCst),
            batches_failed: self.batches_failed.load(Ordering::SeqCst),
            records_sent: self.records_sent.load(Ordering::SeqCst),
            records_failed: self.records_failed.load(Ordering::SeqCst),
            ..PoolStats::default()
        }
    }
}

/// A fixed set of workers consuming one batch channel.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    receiver: Arc<Mutex<mpsc::Receiver<LogBatch>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Spawn `workers` tasks draining `rx` into `sink`.
    ///
    /// Workers stop when every sender is dropped and the channel is empty, or
    /// as soon as `cancel` fires. Queued batches are abandoned on cancellation.
    /// A pool without workers closes the channel right away.
    pub fn spawn(
        workers: usize,
        mut rx: mpsc::Receiver<LogBatch>,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Self {
        if workers == 0 {
            rx.close();
        }
        let receiver = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let sink = sink.clone();
                let cancel = cancel.clone();
                let counters = counters.clone();

                tokio::spawn(async move {
                    consume_log_batches(worker_id, receiver, sink, cancel, counters).await
                })
            })
            .collect();

        Self {
            handles,
            receiver,
            counters,
        }
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit and account for batches left behind.
    pub async fn join(self) -> PoolStats {
        let mut stats = PoolStats::default();

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Log batch worker terminated abnormally");
                stats.workers_panicked += 1;
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok(batch) = receiver.try_recv() {
            stats.batches_abandoned += 1;
            stats.records_abandoned += batch.len() as u64;
        }
        if stats.batches_abandoned > 0 {
            warn!(
                batches = stats.batches_abandoned,
                records = stats.records_abandoned,
                "Log batches abandoned on cancellation"
            );
        }

        PoolStats {
            batches_abandoned: stats.batches_abandoned,
            records_abandoned: stats.records_abandoned,
            workers_panicked: stats.workers_panicked,
            ..self.counters.snapshot()
        }
    }
}

/// Worker loop: receive a batch or observe cancellation, whichever is first.
async fn consume_log_batches(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<LogBatch>>>,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    debug!(worker_id = worker_id, "Worker started");

    loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(worker_id = worker_id, "Worker cancelled");
                receiver.lock().await.close();
                return;
            }

            batch = async { receiver.lock().await.recv().await } => batch,
        };

        let Some(batch) = next else {
            debug!(worker_id = worker_id, "Channel closed, worker exiting");
            return;
        };

        let records = batch.len() as u64;
        match sink.send(&batch).await {
            Ok(()) => {
                debug!(
                    worker_id = worker_id,
                    batch_id = %batch.batch_id,
                    batch_size = records,
                    "Log batch delivered"
                );
                counters.batches_sent.fetch_add(1, Ordering::SeqCst);
                counters.records_sent.fetch_add(records, Ordering::SeqCst);
            }
            Err(e) => {
                error!(
                    worker_id = worker_id,
                    batch_id = %batch.batch_id,
                    batch_size = records,
                    error = %e,
                    "Error posting log batch"
                );
                counters.batches_failed.fetch_add(1, Ordering::SeqCst);
                counters.records_failed.fetch_add(records, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::record::{Attributes, Record};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Sink that records delivered batch ids and fails on request.
    #[derive(Default)]
    struct RecordingSink {
        delivered: StdMutex<Vec<Uuid>>,
        attempts: AtomicU64,
        fail: StdMutex<HashSet<Uuid>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn send(&self, batch: &LogBatch) -> Result<(), ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.lock().unwrap().contains(&batch.batch_id) {
                return Err(ClientError::Status {
                    code: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "ingest failure".to_string(),
                });
            }
            self.delivered.lock().unwrap().push(batch.batch_id);
            Ok(())
        }
    }

    fn batch(records: usize) -> LogBatch {
        LogBatch::new(vec![Record::new(); records], Attributes::new())
    }

    #[tokio::test]
    async fn test_workers_drain_channel_and_exit() {
        let (tx, rx) = mpsc::channel(10);
        let sink = Arc::new(RecordingSink::default());
        let pool = WorkerPool::spawn(3, rx, sink.clone(), CancellationToken::new());
        assert_eq!(pool.len(), 3);

        for _ in 0..5 {
            tx.send(batch(2)).await.unwrap();
        }
        drop(tx);

        let stats = pool.join().await;
        assert_eq!(stats.batches_sent, 5);
        assert_eq!(stats.records_sent, 10);
        assert_eq!(stats.batches_failed, 0);
        assert_eq!(sink.delivered.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_delivery() {
        let (tx, rx) = mpsc::channel(10);
        let failing = batch(1);
        let healthy = batch(3);

        let sink = Arc::new(RecordingSink::default());
        sink.fail.lock().unwrap().insert(failing.batch_id);
        let pool = WorkerPool::spawn(2, rx, sink.clone(), CancellationToken::new());

        let healthy_id = healthy.batch_id;
        tx.send(failing).await.unwrap();
        tx.send(healthy).await.unwrap();
        drop(tx);

        let stats = pool.join().await;
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.records_failed, 1);
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(*sink.delivered.lock().unwrap(), vec![healthy_id]);
    }

    #[tokio::test]
    async fn test_single_worker_survives_failures() {
        let (tx, rx) = mpsc::channel(10);
        let sink = Arc::new(RecordingSink::default());
        let batches: Vec<LogBatch> = (0..4).map(|_| batch(1)).collect();
        for b in &batches[..2] {
            sink.fail.lock().unwrap().insert(b.batch_id);
        }
        let pool = WorkerPool::spawn(1, rx, sink.clone(), CancellationToken::new());

        for b in batches {
            tx.send(b).await.unwrap();
        }
        drop(tx);

        let stats = pool.join().await;
        assert_eq!(stats.batches_failed, 2);
        assert_eq!(stats.batches_sent, 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers_without_draining() {
        let (tx, rx) = mpsc::channel(10);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();

        cancel.cancel();
        for _ in 0..3 {
            tx.send(batch(1)).await.unwrap();
        }

        let pool = WorkerPool::spawn(2, rx, sink.clone(), cancel);
        // The sender is still alive, so only cancellation can end the workers.
        let stats = tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("workers exit promptly");

        assert_eq!(stats.batches_sent, 0);
        assert_eq!(stats.batches_abandoned, 3);
        assert_eq!(stats.records_abandoned, 3);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);
        assert!(tx.send(batch(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_send_completes_after_cancel() {
        let (tx, rx) = mpsc::channel(10);
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_secs(5)),
            ..RecordingSink::default()
        });
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(1, rx, sink.clone(), cancel.clone());

        tx.send(batch(1)).await.unwrap();
        tx.send(batch(1)).await.unwrap();
        // Let the worker pick up the first batch and start posting it.
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let stats = pool.join().await;
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.batches_abandoned, 1);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_waiting_producer() {
        let (tx, rx) = mpsc::channel(1);
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_secs(5)),
            ..RecordingSink::default()
        });
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(1, rx, sink.clone(), cancel.clone());

        // One batch in flight, one queued, the third send waits for room.
        let producer = tokio::spawn(async move {
            let mut handed_over = 0;
            for _ in 0..3 {
                if tx.send(batch(2)).await.is_err() {
                    break;
                }
                handed_over += 1;
            }
            handed_over
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let handed_over = producer.await.unwrap();
        let stats = pool.join().await;

        assert_eq!(handed_over, 2);
        assert_eq!(stats.records_sent + stats.records_abandoned, 4);
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.batches_abandoned, 1);
    }

    #[tokio::test]
    async fn test_zero_workers_pool() {
        let (_tx, rx) = mpsc::channel::<LogBatch>(1);
        let pool = WorkerPool::spawn(0, rx, Arc::new(RecordingSink::default()), CancellationToken::new());
        assert!(pool.is_empty());
        assert_eq!(pool.join().await, PoolStats::default());
    }
}
