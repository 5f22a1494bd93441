//! Configuration module for the log forwarder.
//!
//! Settings come from the function's environment variables. Unset values fall
//! back to defaults; malformed values are reported as [`ConfigError`], except
//! `CLIENT_TTL` and `REQUEST_TIMEOUT_SECS` which silently use their defaults.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::batcher::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::cache::DEFAULT_CLIENT_TTL;
use crate::client::Region;

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 6;

/// Upper bound on the worker pool size
const MAX_WORKERS: usize = 64;

/// Default capacity of the batch channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_LICENSE_KEY: &str = "LICENSE_KEY";
pub const ENV_SECRET_OCID: &str = "SECRET_OCID";
pub const ENV_VAULT_REGION: &str = "VAULT_REGION";
pub const ENV_VAULT_ENDPOINT: &str = "VAULT_ENDPOINT";
pub const ENV_RESOURCE_PRINCIPAL_TOKEN: &str = "OCI_RESOURCE_PRINCIPAL_RPST";
pub const ENV_RESOURCE_PRINCIPAL_PRIVATE_KEY: &str = "OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM";
pub const ENV_NEW_RELIC_REGION: &str = "NEW_RELIC_REGION";
pub const ENV_LOGS_ENDPOINT: &str = "NEW_RELIC_LOGS_ENDPOINT";
pub const ENV_MAX_PAYLOAD_SIZE: &str = "MAX_PAYLOAD_SIZE";
pub const ENV_WORKERS: &str = "NUMBER_OF_WORKERS";
pub const ENV_CHANNEL_CAPACITY: &str = "CHANNEL_CAPACITY";
pub const ENV_CLIENT_TTL: &str = "CLIENT_TTL";
pub const ENV_CACHE_POLICY: &str = "CLIENT_CACHE_POLICY";
pub const ENV_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT_SECS";
pub const ENV_CUSTOM_META_DATA: &str = "CUSTOM_META_DATA";
pub const ENV_DEBUG_ENABLED: &str = "DEBUG_ENABLED";

/// How the Log API client is cached between invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Rebuild after `CLIENT_TTL` seconds
    #[default]
    Ttl,

    /// Build once per process
    Once,
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ttl" => Ok(CachePolicy::Ttl),
            "once" => Ok(CachePolicy::Once),
            other => Err(format!("unknown cache policy '{}'", other)),
        }
    }
}

/// Configuration for the log forwarder.
#[derive(Debug, Clone)]
pub struct Config {
    /// License key override; bypasses the vault when set
    pub license_key: Option<String>,

    /// OCID of the vault secret holding the license key
    pub secret_id: Option<String>,

    /// Region of the vault
    pub vault_region: Option<String>,

    /// Base URL overriding the regional secrets endpoint
    pub vault_endpoint: Option<String>,

    /// Resource principal session token, or a path to it
    pub resource_principal_token: Option<String>,

    /// Resource principal PEM private key used to sign vault requests, or a
    /// path to it
    pub resource_principal_private_key: Option<String>,

    /// New Relic data center
    pub region: Region,

    /// Full URL of the Log API endpoint
    pub logs_endpoint: String,

    /// Byte budget of one batch
    pub max_payload_size: usize,

    /// Number of concurrent workers
    pub workers: usize,

    /// Capacity of the batch channel
    pub channel_capacity: usize,

    /// Age after which the cached client is rebuilt
    pub client_ttl: Duration,

    /// Client caching strategy
    pub cache_policy: CachePolicy,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Extra attributes attached to every batch
    pub custom_metadata: BTreeMap<String, String>,

    /// Whether debug logging is enabled
    pub debug_enabled: bool,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn invalid(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `NEW_RELIC_REGION` or `CLIENT_CACHE_POLICY` has an unknown value
    /// - `MAX_PAYLOAD_SIZE`, `NUMBER_OF_WORKERS` or `CHANNEL_CAPACITY` is not
    ///   a valid number or is out of range
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let region = match var(ENV_NEW_RELIC_REGION) {
            Some(value) => value
                .parse::<Region>()
                .map_err(|e| ConfigError::invalid(ENV_NEW_RELIC_REGION, e))?,
            None => Region::default(),
        };

        let logs_endpoint = var(ENV_LOGS_ENDPOINT)
            .unwrap_or_else(|| region.logs_endpoint().to_string());

        let max_payload_size = Self::parse_positive(
            ENV_MAX_PAYLOAD_SIZE,
            var(ENV_MAX_PAYLOAD_SIZE),
            DEFAULT_MAX_PAYLOAD_SIZE,
        )?;

        let workers = Self::parse_positive(ENV_WORKERS, var(ENV_WORKERS), DEFAULT_WORKERS)?;
        if workers > MAX_WORKERS {
            return Err(ConfigError::invalid(
                ENV_WORKERS,
                format!(
                    "worker count {} exceeds maximum allowed ({})",
                    workers, MAX_WORKERS
                ),
            ));
        }

        let channel_capacity = Self::parse_positive(
            ENV_CHANNEL_CAPACITY,
            var(ENV_CHANNEL_CAPACITY),
            DEFAULT_CHANNEL_CAPACITY,
        )?;

        let cache_policy = match var(ENV_CACHE_POLICY) {
            Some(value) => value
                .parse::<CachePolicy>()
                .map_err(|e| ConfigError::invalid(ENV_CACHE_POLICY, e))?,
            None => CachePolicy::default(),
        };

        let request_timeout_secs: u64 = var(ENV_REQUEST_TIMEOUT)
            .and_then(|v| v.trim().parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(Self {
            license_key: var(ENV_LICENSE_KEY),
            secret_id: var(ENV_SECRET_OCID),
            vault_region: var(ENV_VAULT_REGION),
            vault_endpoint: var(ENV_VAULT_ENDPOINT),
            resource_principal_token: var(ENV_RESOURCE_PRINCIPAL_TOKEN),
            resource_principal_private_key: var(ENV_RESOURCE_PRINCIPAL_PRIVATE_KEY),
            region,
            logs_endpoint,
            max_payload_size,
            workers,
            channel_capacity,
            client_ttl: parse_client_ttl(var(ENV_CLIENT_TTL).as_deref()),
            cache_policy,
            request_timeout: Duration::from_secs(request_timeout_secs),
            custom_metadata: var(ENV_CUSTOM_META_DATA)
                .map(|v| parse_custom_metadata(&v))
                .unwrap_or_default(),
            debug_enabled: var(ENV_DEBUG_ENABLED)
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Parse a strictly positive count, defaulting when unset.
    fn parse_positive(
        env_var: &str,
        value: Option<String>,
        default: usize,
    ) -> Result<usize, ConfigError> {
        match value {
            Some(value) => {
                let parsed: usize = value.trim().parse().map_err(|_| {
                    ConfigError::invalid(env_var, format!("'{}' is not a valid number", value))
                })?;

                if parsed == 0 {
                    return Err(ConfigError::invalid(env_var, "value must be greater than 0"));
                }

                Ok(parsed)
            }
            None => Ok(default),
        }
    }
}

/// Parse the client TTL in seconds.
///
/// Unset, unparsable, zero and negative values all yield the default TTL.
pub fn parse_client_ttl(value: Option<&str>) -> Duration {
    match value.map(|v| v.trim().parse::<i64>()) {
        Some(Ok(secs)) if secs > 0 => Duration::from_secs(secs as u64),
        Some(_) => {
            warn!(
                value = value.unwrap_or_default(),
                default_secs = DEFAULT_CLIENT_TTL.as_secs(),
                "Invalid CLIENT_TTL, using default"
            );
            DEFAULT_CLIENT_TTL
        }
        None => DEFAULT_CLIENT_TTL,
    }
}

/// Parse `key=value;key2=value2` pairs, skipping malformed ones.
pub fn parse_custom_metadata(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Some((key.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                warn!(pair = pair, "Ignoring malformed custom metadata entry");
                None
            }
        })
        .collect()
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            license_key: None,
            secret_id: None,
            vault_region: None,
            vault_endpoint: None,
            resource_principal_token: None,
            resource_principal_private_key: None,
            region: Region::default(),
            logs_endpoint: Region::default().logs_endpoint().to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            workers: DEFAULT_WORKERS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            client_ttl: DEFAULT_CLIENT_TTL,
            cache_policy: CachePolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            custom_metadata: BTreeMap::new(),
            debug_enabled: false,
        }
    }
}
