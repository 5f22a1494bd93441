//! End-to-end forwarding of one function invocation.
//!
//! The driver decodes the input, obtains the sink from the client cache,
//! starts the worker pool, batches the records onto the channel, closes it and
//! waits for every worker to finish. Decoding and sink acquisition failures
//! abort the run before any worker exists; delivery failures only show up in
//! the returned [`RunSummary`]. Every decoded record ends up in exactly one of
//! `records_sent`, `records_failed`, `records_dropped` or `records_undelivered`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batcher::{BatchError, Batcher};
use crate::cache::{AcquireError, ClientCache};
use crate::config::Config;
use crate::consumer::WorkerPool;
use crate::event::{parse_event, EventType, ParseError};
use crate::record::{Attributes, Record};

/// Settings of the batching and delivery stages.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Byte budget of one batch
    pub max_payload_size: usize,

    /// Number of concurrent workers
    pub workers: usize,

    /// Capacity of the batch channel
    pub channel_capacity: usize,

    /// Attributes shared by every batch
    pub attributes: Attributes,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_payload_size: config.max_payload_size,
            workers: config.workers,
            channel_capacity: config.channel_capacity,
            attributes: Attributes::for_run(&config.custom_metadata),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Records decoded from the input
    pub records_in: u64,

    /// Records skipped because they could not be sized
    pub records_dropped: u64,

    /// Records never offered to the sink because the run was cancelled
    pub records_undelivered: u64,

    /// Batches handed to the workers
    pub batches_emitted: u64,

    /// Batches accepted by the sink
    pub batches_sent: u64,

    /// Batches the sink failed on
    pub batches_failed: u64,

    /// Records inside accepted batches
    pub records_sent: u64,

    /// Records inside failed batches
    pub records_failed: u64,

    /// Workers that ended by panicking
    pub workers_panicked: u64,

    /// Whether the run was cancelled
    pub cancelled: bool,
}

/// Errors that abort a run before delivery starts.
#[derive(Debug)]
pub enum PipelineError {
    /// The input could not be decoded
    Parse(ParseError),

    /// No sink could be obtained
    Acquire(AcquireError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Parse(e) => write!(f, "Error unmarshalling event: {}", e),
            PipelineError::Acquire(e) => write!(f, "Error initializing Log API client: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Parse(e) => Some(e),
            PipelineError::Acquire(e) => Some(e),
        }
    }
}

impl From<ParseError> for PipelineError {
    fn from(err: ParseError) -> Self {
        PipelineError::Parse(err)
    }
}

impl From<AcquireError> for PipelineError {
    fn from(err: AcquireError) -> Self {
        PipelineError::Acquire(err)
    }
}

/// Pipeline driver bound to a process-wide client cache.
pub struct Pipeline {
    settings: PipelineSettings,
    cache: Arc<dyn ClientCache>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, cache: Arc<dyn ClientCache>) -> Self {
        Self { settings, cache }
    }

    /// Decode raw input and forward its records.
    pub async fn run(
        &self,
        input: &[u8],
        cancel: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let event = parse_event(input)?;
        info!(
            event_type = %event.event_type,
            records = event.records.len(),
            payload_bytes = input.len(),
            "Received log event"
        );

        match event.event_type {
            EventType::OciLogging => self.forward(event.records, cancel).await,
        }
    }

    /// Batch `records` and deliver them through the worker pool.
    pub async fn forward(
        &self,
        records: Vec<Record>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary {
            records_in: records.len() as u64,
            ..RunSummary::default()
        };

        if records.is_empty() {
            info!("No log records to forward");
            summary.cancelled = cancel.is_cancelled();
            return Ok(summary);
        }

        if cancel.is_cancelled() {
            warn!(records = records.len(), "Run cancelled before delivery started");
            summary.records_undelivered = summary.records_in;
            summary.cancelled = true;
            return Ok(summary);
        }

        let sink = self.cache.acquire().await?;

        // Workers are running before the first batch can be sent.
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let pool = WorkerPool::spawn(self.settings.workers, rx, sink, cancel.clone());

        let mut batcher = Batcher::new(
            self.settings.max_payload_size,
            self.settings.attributes.clone(),
        );
        if let Err(e) = batcher.produce(records, &tx).await {
            warn!(error = %e, "Stopped batching early");
            let BatchError::Closed { undelivered } = e;
            summary.records_undelivered = undelivered as u64;
        }
        // Closing the channel is the workers' end-of-input signal.
        drop(tx);

        let pool_stats = pool.join().await;
        let batch_stats = batcher.stats();

        summary.records_dropped = batch_stats.records_dropped;
        summary.records_undelivered += pool_stats.records_abandoned;
        summary.batches_emitted = batch_stats.batches_emitted;
        summary.batches_sent = pool_stats.batches_sent;
        summary.batches_failed = pool_stats.batches_failed;
        summary.records_sent = pool_stats.records_sent;
        summary.records_failed = pool_stats.records_failed;
        summary.workers_panicked = pool_stats.workers_panicked;
        summary.cancelled = cancel.is_cancelled();

        info!(
            records_in = summary.records_in,
            records_sent = summary.records_sent,
            batches_sent = summary.batches_sent,
            batches_failed = summary.batches_failed,
            records_dropped = summary.records_dropped,
            records_undelivered = summary.records_undelivered,
            cancelled = summary.cancelled,
            "Log forwarding finished"
        );

        Ok(summary)
    }
}
