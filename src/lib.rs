//! OCI Log Forwarder Library
//!
//! This library provides the components of a serverless log forwarder that
//! batches OCI Logging records and posts them to the New Relic Log API:
//!
//! - **record**: Log records, common attributes and the detailed-logs payload
//! - **event**: Decoding of the raw function input
//! - **batcher**: Size-bounded batching onto a bounded channel
//! - **secrets**: License key resolution from an override or an OCI Vault secret
//! - **signer**: OCI HTTP request signing with the resource principal key
//! - **client**: Gzip-compressed Log API client
//! - **cache**: Process-wide client reuse across invocations
//! - **consumer**: Worker pool draining the batch channel
//! - **pipeline**: End-to-end driver for one invocation
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use oci_log_forwarder::cache;
//! use oci_log_forwarder::config::Config;
//! use oci_log_forwarder::pipeline::{Pipeline, PipelineSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // One cache per process, shared by every invocation
//!     let cache = cache::from_config(&config);
//!     let pipeline = Pipeline::new(PipelineSettings::from(&config), cache);
//!
//!     let input = br#"[{"message":"hello","level":"INFO"}]"#;
//!     let summary = pipeline
//!         .run(input, CancellationToken::new())
//!         .await
//!         .expect("Failed to forward logs");
//!     println!("{} records sent", summary.records_sent);
//! }
//! ```

// Module declarations
pub mod batcher;
pub mod cache;
pub mod client;
pub mod config;
pub mod consumer;
pub mod event;
pub mod pipeline;
pub mod record;
pub mod secrets;
pub mod signer;

// Re-export commonly used types at crate root for convenience
pub use batcher::{BatchError, Batcher, BatcherStats};
pub use cache::{AcquireError, ClientCache, OnceClientCache, TtlClientCache};
pub use client::{ClientError, LogSink, NewRelicLogClient, Region};
pub use config::{CachePolicy, Config, ConfigError};
pub use consumer::{PoolStats, WorkerPool};
pub use event::{parse_event, Event, EventType, ParseError};
pub use pipeline::{Pipeline, PipelineError, PipelineSettings, RunSummary};
pub use record::{Attributes, LogBatch, Record};
pub use secrets::{CredentialResolver, CredentialSource, LicenseKey, OciVaultClient, SecretError};
pub use signer::RequestSigner;
