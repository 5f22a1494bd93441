//! HTTP sink for delivering log batches to the New Relic Log API.
//!
//! Delivery is at-most-once: each batch is posted exactly one time and a
//! failure is reported to the caller, never retried here.

use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::record::LogBatch;
use crate::secrets::LicenseKey;

/// Log API endpoint for US accounts.
pub const US_LOGS_ENDPOINT: &str = "https://log-api.newrelic.com/log/v1";

/// Log API endpoint for EU accounts.
pub const EU_LOGS_ENDPOINT: &str = "https://log-api.eu.newrelic.com/log/v1";

/// Header carrying the license key.
const LICENSE_KEY_HEADER: &str = "Api-Key";

/// A destination that accepts one batch per call.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver a batch. The sink owns encoding and transport.
    async fn send(&self, batch: &LogBatch) -> Result<(), ClientError>;
}

/// New Relic data center hosting the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Us,
    Eu,
}

impl Region {
    /// Log API endpoint for this region.
    pub fn logs_endpoint(&self) -> &'static str {
        match self {
            Region::Us => US_LOGS_ENDPOINT,
            Region::Eu => EU_LOGS_ENDPOINT,
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" => Ok(Region::Us),
            "eu" => Ok(Region::Eu),
            other => Err(format!("unknown New Relic region '{}'", other)),
        }
    }
}

/// Errors that can occur while delivering a batch.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Server returned an error status code
    Status { code: StatusCode, message: String },

    /// Request timeout
    Timeout,

    /// Failed to encode the request body
    Encode(std::io::Error),

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Status { code, message } => {
                write!(f, "Log API error ({}): {}", code, message)
            }
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Encode(e) => write!(f, "Failed to encode payload: {}", e),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            ClientError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Encode(err)
    }
}

/// HTTP client for the New Relic Log API.
///
/// The underlying `reqwest::Client` is reused for connection pooling, so one
/// instance should serve every worker of a run.
pub struct NewRelicLogClient {
    /// The underlying HTTP client
    client: Client,

    /// URL of the Log API endpoint
    endpoint: String,

    /// Credential sent with every request
    license_key: LicenseKey,

    /// Request timeout duration
    timeout: Duration,
}

impl NewRelicLogClient {
    /// Create a new client for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        license_key: LicenseKey,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            license_key,
            timeout,
        })
    }

    /// Gzip the detailed-log payload of a batch.
    fn encode(batch: &LogBatch) -> Result<Vec<u8>, ClientError> {
        let json = serde_json::to_vec(&batch.payload())
            .map_err(|e| ClientError::Encode(e.into()))?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Get the configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl LogSink for NewRelicLogClient {
    async fn send(&self, batch: &LogBatch) -> Result<(), ClientError> {
        let body = Self::encode(batch)?;

        debug!(
            batch_id = %batch.batch_id,
            batch_size = batch.len(),
            compressed_bytes = body.len(),
            url = %self.endpoint,
            "Posting log batch"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(LICENSE_KEY_HEADER, self.license_key.expose())
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ClientError::Status {
                code: status,
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Attributes, Record};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn test_batch(size: usize) -> LogBatch {
        let records: Vec<Record> = (0..size)
            .map(|i| {
                let mut record = Record::new();
                record.insert("message".into(), format!("line {}", i).into());
                record
            })
            .collect();
        LogBatch::new(records, Attributes::instrumentation())
    }

    #[test]
    fn test_region_parsing() {
        assert_eq!("us".parse::<Region>(), Ok(Region::Us));
        assert_eq!(" EU ".parse::<Region>(), Ok(Region::Eu));
        assert!("apac".parse::<Region>().is_err());
        assert_eq!(Region::default().logs_endpoint(), US_LOGS_ENDPOINT);
        assert_eq!(Region::Eu.logs_endpoint(), EU_LOGS_ENDPOINT);
    }

    #[test]
    fn test_client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::FORBIDDEN,
            message: "invalid license key".to_string(),
        };
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("invalid license key"));
    }

    #[test]
    fn test_client_creation() {
        let client = NewRelicLogClient::new(
            "http://localhost:9999/log/v1",
            LicenseKey::new("abc"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:9999/log/v1");
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_encode_is_gzipped_detailed_json() {
        let batch = test_batch(2);
        let body = NewRelicLogClient::encode(&batch).unwrap();

        let mut json = String::new();
        GzDecoder::new(body.as_slice()).read_to_string(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["logs"].as_array().unwrap().len(), 2);
        assert_eq!(value[0]["logs"][1]["message"], "line 1");
    }
}
