//! OCI Log Forwarder - Function entry point for OCI Logging to New Relic
//!
//! The function host hands one invocation payload to the process on stdin.
//! The records are batched, posted to the New Relic Log API by a pool of
//! workers, and a JSON run summary is written to stdout.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LICENSE_KEY`: New Relic license key (skips the vault when set)
//! - `SECRET_OCID` / `VAULT_REGION`: Vault secret holding the license key
//! - `OCI_RESOURCE_PRINCIPAL_RPST` / `OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM`:
//!   Resource principal session used to sign vault requests
//! - `NEW_RELIC_REGION`: `US` or `EU` (default: US)
//! - `NUMBER_OF_WORKERS`: Concurrent workers (default: 6)
//! - `MAX_PAYLOAD_SIZE`: Bytes per batch (default: 1 MiB)
//! - `CLIENT_TTL`: Seconds a cached client is reused (default: 600)
//! - `CUSTOM_META_DATA`: `key=value` pairs attached to every batch
//! - `DEBUG_ENABLED`: Enable debug logging (default: false)
//! - `RUST_LOG`: Logging level filter, overrides `DEBUG_ENABLED`

use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oci_log_forwarder::cache;
use oci_log_forwarder::config::Config;
use oci_log_forwarder::pipeline::{Pipeline, PipelineSettings};

#[tokio::main]
async fn main() {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            init_tracing(config.debug_enabled);
            info!(
                logs_endpoint = %config.logs_endpoint,
                workers = config.workers,
                max_payload_size = config.max_payload_size,
                client_ttl_secs = config.client_ttl.as_secs(),
                cache_policy = ?config.cache_policy,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            init_tracing(false);
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let mut input = Vec::new();
    if let Err(e) = tokio::io::stdin().read_to_end(&mut input).await {
        error!(error = %e, "Failed to read invocation payload");
        std::process::exit(1);
    }

    let pipeline = Pipeline::new(PipelineSettings::from(&config), cache::from_config(&config));

    // Cancel the workers on shutdown signal
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    let signal_handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, cancelling workers");
                signal_token.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
    });

    let result = pipeline.run(&input, cancel).await;
    signal_handle.abort();

    match result {
        Ok(summary) => match serde_json::to_string(&summary) {
            Ok(body) => println!("{}", body),
            Err(e) => {
                error!(error = %e, "Failed to encode run summary");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(error = %e, "Log forwarding failed");
            println!("{}", json!({ "error": e.to_string() }));
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// Logs go to stderr; stdout carries the function response.
fn init_tracing(debug_enabled: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(debug_enabled)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn default_level(debug_enabled: bool) -> &'static str {
    if debug_enabled {
        "debug"
    } else {
        "info"
    }
}
