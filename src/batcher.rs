//! Batcher module for splitting log records into payload-sized batches.
//!
//! Records are accumulated in arrival order while their serialized size fits
//! within the payload budget. A record that would overflow a non-empty batch
//! closes that batch and opens the next one. Records are never split, so a
//! single record larger than the budget travels alone.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::record::{Attributes, LogBatch, Record};

/// Default payload budget accepted by the Log API (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Estimates the serialized size of a record in bytes.
pub type SizeEstimator = fn(&Record) -> Result<usize, serde_json::Error>;

/// Size of the record's compact JSON encoding.
pub fn json_size(record: &Record) -> Result<usize, serde_json::Error> {
    serde_json::to_vec(record).map(|bytes| bytes.len())
}

/// Statistics about batching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Total number of records offered to the batcher
    pub records_received: u64,

    /// Total number of records placed in an emitted batch
    pub records_batched: u64,

    /// Records skipped because their size could not be estimated
    pub records_dropped: u64,

    /// Number of batches emitted
    pub batches_emitted: u64,

    /// Records emitted alone because they exceed the budget by themselves
    pub oversized_records: u64,
}

/// Errors that can occur while handing batches to the workers.
#[derive(Debug)]
pub enum BatchError {
    /// Every receiver is gone; the batch and the remaining input were discarded
    Closed {
        /// Records not delivered to any worker
        undelivered: usize,
    },
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchError::Closed { undelivered } => write!(
                f,
                "Batch channel has been closed, {} records not delivered",
                undelivered
            ),
        }
    }
}

impl std::error::Error for BatchError {}

/// Size-aware batch builder.
///
/// # Example
///
/// ```
/// use oci_log_forwarder::batcher::Batcher;
/// use oci_log_forwarder::record::{Attributes, Record};
///
/// let records: Vec<Record> = (0..3)
///     .map(|i| {
///         let mut record = Record::new();
///         record.insert("message".into(), format!("line {i}").into());
///         record
///     })
///     .collect();
///
/// let mut batcher = Batcher::new(1000, Attributes::instrumentation());
/// let batches = batcher.split(records);
/// assert_eq!(batches.len(), 1);
/// assert_eq!(batches[0].len(), 3);
/// ```
pub struct Batcher {
    /// Byte budget for the serialized records of one batch
    max_payload_size: usize,

    /// Attributes attached to every emitted batch
    attributes: Attributes,

    /// Record size estimation
    estimator: SizeEstimator,

    /// Records of the batch being built
    current: Vec<Record>,

    /// Serialized size of `current`
    current_size: usize,

    /// Statistics about batching
    stats: BatcherStats,
}

impl Batcher {
    /// Create a batcher with the given payload budget and shared attributes.
    pub fn new(max_payload_size: usize, attributes: Attributes) -> Self {
        Self {
            max_payload_size,
            attributes,
            estimator: json_size,
            current: Vec::new(),
            current_size: 0,
            stats: BatcherStats::default(),
        }
    }

    /// Replace the record size estimator.
    pub fn with_estimator(mut self, estimator: SizeEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Split records into batches without a channel.
    pub fn split<I>(&mut self, records: I) -> Vec<LogBatch>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut batches: Vec<LogBatch> = records
            .into_iter()
            .filter_map(|record| self.push(record))
            .collect();
        batches.extend(self.finish());

        for batch in &batches {
            self.count_emitted(batch.len());
        }
        batches
    }

    /// Batch records and send each batch on `tx` as soon as it is closed.
    ///
    /// Sending waits while the channel is full, so batching proceeds at the
    /// pace of the consumers. Returns once the last batch is handed over.
    pub async fn produce<I>(
        &mut self,
        records: I,
        tx: &mpsc::Sender<LogBatch>,
    ) -> Result<(), BatchError>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut records = records.into_iter();

        while let Some(record) = records.next() {
            if let Some(batch) = self.push(record) {
                // The record that closed `batch` now sits in `current`.
                let pending = self.current.len() + records.size_hint().0;
                self.send(tx, batch, pending).await?;
            }
        }

        match self.finish() {
            Some(batch) => self.send(tx, batch, 0).await,
            None => Ok(()),
        }
    }

    /// Hand a batch to the channel. A batch only counts as emitted once a
    /// receiver has it.
    async fn send(
        &mut self,
        tx: &mpsc::Sender<LogBatch>,
        batch: LogBatch,
        pending: usize,
    ) -> Result<(), BatchError> {
        let records = batch.len();
        match tx.send(batch).await {
            Ok(()) => {
                self.count_emitted(records);
                Ok(())
            }
            Err(e) => Err(BatchError::Closed {
                undelivered: e.0.len() + pending,
            }),
        }
    }

    fn count_emitted(&mut self, records: usize) {
        self.stats.records_batched += records as u64;
        self.stats.batches_emitted += 1;
    }

    /// Add a record, returning the previous batch if the record closed it.
    fn push(&mut self, record: Record) -> Option<LogBatch> {
        self.stats.records_received += 1;

        let size = match (self.estimator)(&record) {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "Could not serialize log record for size estimation, skipping");
                self.stats.records_dropped += 1;
                return None;
            }
        };

        if size > self.max_payload_size {
            self.stats.oversized_records += 1;
            debug!(
                record_size = size,
                max_payload_size = self.max_payload_size,
                "Log record exceeds payload budget, sending it alone"
            );
        }

        let flushed = if !self.current.is_empty()
            && self.current_size + size > self.max_payload_size
        {
            debug!(
                batch_size = self.current.len(),
                payload_bytes = self.current_size,
                "Payload budget reached, closing batch"
            );
            Some(self.create_batch())
        } else {
            None
        };

        self.current.push(record);
        self.current_size += size;
        flushed
    }

    /// Close the batch being built, if any.
    fn finish(&mut self) -> Option<LogBatch> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.create_batch())
        }
    }

    /// Create a batch from the current records and reset the running size.
    fn create_batch(&mut self) -> LogBatch {
        let records = std::mem::take(&mut self.current);
        self.current_size = 0;

        LogBatch::new(records, self.attributes.clone())
    }

    /// Get current batching statistics.
    pub fn stats(&self) -> &BatcherStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn record_of_size(approx_bytes: usize, id: usize) -> Record {
        let mut record = Record::new();
        record.insert("id".into(), json!(id));
        record.insert("message".into(), Value::String("x".repeat(approx_bytes)));
        record
    }

    fn poisoned_size(record: &Record) -> Result<usize, serde_json::Error> {
        if record.contains_key("poison") {
            Err(<serde_json::Error as serde::ser::Error>::custom(
                "unsupported value",
            ))
        } else {
            json_size(record)
        }
    }

    fn ids(batch: &LogBatch) -> Vec<u64> {
        batch
            .records
            .iter()
            .map(|r| r["id"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_small_records_share_one_batch() {
        let records: Vec<Record> = (0..3).map(|i| record_of_size(30, i)).collect();
        let mut batcher = Batcher::new(1000, Attributes::instrumentation());

        let batches = batcher.split(records);
        assert_eq!(batches.len(), 1);
        assert_eq!(ids(&batches[0]), vec![0, 1, 2]);
        assert_eq!(batches[0].attributes, Attributes::instrumentation());
    }

    #[test]
    fn test_large_records_each_get_a_batch() {
        let records: Vec<Record> = (0..3).map(|i| record_of_size(300, i)).collect();
        let mut batcher = Batcher::new(100, Attributes::new());

        let batches = batcher.split(records);
        assert_eq!(batches.len(), 3);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(ids(batch), vec![i as u64]);
        }
        assert_eq!(batcher.stats().oversized_records, 3);
    }

    #[test]
    fn test_empty_input_yields_no_batches() {
        let mut batcher = Batcher::new(1000, Attributes::new());
        assert!(batcher.split(Vec::new()).is_empty());
        assert_eq!(batcher.stats(), &BatcherStats::default());
    }

    #[test]
    fn test_single_oversized_record_is_not_split() {
        let record = record_of_size(5000, 7);
        assert!(json_size(&record).unwrap() > 1000);

        let mut batcher = Batcher::new(1000, Attributes::new());
        let batches = batcher.split(vec![record.clone()]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records, vec![record]);
    }

    #[test]
    fn test_oversized_record_between_small_ones() {
        let records = vec![
            record_of_size(10, 0),
            record_of_size(10, 1),
            record_of_size(2000, 2),
            record_of_size(10, 3),
        ];
        let mut batcher = Batcher::new(200, Attributes::new());

        let batches = batcher.split(records);
        let grouped: Vec<Vec<u64>> = batches.iter().map(ids).collect();
        assert_eq!(grouped, vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn test_size_bound_and_count_conservation() {
        let max = 500;
        let records: Vec<Record> = (0..200).map(|i| record_of_size((i * 37) % 180, i)).collect();
        let mut batcher = Batcher::new(max, Attributes::new());

        let batches = batcher.split(records);
        let mut seen = Vec::new();
        for batch in &batches {
            assert!(!batch.is_empty());
            let size: usize = batch.records.iter().map(|r| json_size(r).unwrap()).sum();
            assert!(size <= max || batch.len() == 1, "batch of {} bytes", size);
            seen.extend(ids(batch));
        }

        // Every record exactly once, in input order.
        assert_eq!(seen, (0..200).collect::<Vec<u64>>());
        assert_eq!(batcher.stats().records_batched, 200);
        assert_eq!(batcher.stats().batches_emitted, batches.len() as u64);
    }

    #[test]
    fn test_unserializable_record_is_skipped() {
        let mut poisoned = record_of_size(10, 1);
        poisoned.insert("poison".into(), json!(true));
        let records = vec![record_of_size(10, 0), poisoned, record_of_size(10, 2)];

        let mut batcher = Batcher::new(1000, Attributes::new()).with_estimator(poisoned_size);
        let batches = batcher.split(records);

        assert_eq!(batches.len(), 1);
        assert_eq!(ids(&batches[0]), vec![0, 2]);
        assert_eq!(batcher.stats().records_received, 3);
        assert_eq!(batcher.stats().records_dropped, 1);
        assert_eq!(batcher.stats().records_batched, 2);
    }

    #[tokio::test]
    async fn test_produce_sends_every_batch() {
        let (tx, mut rx) = mpsc::channel(10);
        let records: Vec<Record> = (0..3).map(|i| record_of_size(300, i)).collect();

        let mut batcher = Batcher::new(100, Attributes::new());
        batcher.produce(records, &tx).await.expect("receiver alive");
        drop(tx);

        let mut received = Vec::new();
        while let Some(batch) = rx.recv().await {
            received.extend(ids(&batch));
        }
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_blocks_while_channel_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let records: Vec<Record> = (0..5).map(|i| record_of_size(300, i)).collect();
        let mut batcher = Batcher::new(100, Attributes::new());

        // Nobody receives: the first batch fills the channel, the second waits.
        let blocked = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            batcher.produce(records, &tx),
        )
        .await
        .is_err();

        assert!(blocked, "producer finished without a consumer");
        assert_eq!(batcher.stats().batches_emitted, 1);
        assert_eq!(ids(&rx.try_recv().unwrap()), vec![0]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_produce_completes_as_consumer_drains() {
        let (tx, mut rx) = mpsc::channel(1);
        let records: Vec<Record> = (0..4).map(|i| record_of_size(300, i)).collect();

        let producer = tokio::spawn(async move {
            let mut batcher = Batcher::new(100, Attributes::new());
            let result = batcher.produce(records, &tx).await;
            result.map(|_| batcher.stats().clone())
        });

        let mut received = Vec::new();
        while let Some(batch) = rx.recv().await {
            received.extend(ids(&batch));
            tokio::task::yield_now().await;
        }

        let stats = producer.await.unwrap().unwrap();
        assert_eq!(received, vec![0, 1, 2, 3]);
        assert_eq!(stats.batches_emitted, 4);
    }

    #[tokio::test]
    async fn test_produce_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let records: Vec<Record> = (0..3).map(|i| record_of_size(300, i)).collect();
        let mut batcher = Batcher::new(100, Attributes::new());

        let err = batcher.produce(records, &tx).await.unwrap_err();
        assert!(matches!(err, BatchError::Closed { undelivered: 3 }));
        assert!(err.to_string().contains("3 records not delivered"));
        assert_eq!(batcher.stats().batches_emitted, 0);
        assert_eq!(batcher.stats().records_batched, 0);
    }
}
