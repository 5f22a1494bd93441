//! Cached access to the Log API sink.
//!
//! Building a sink needs the license key, which may need a vault round trip.
//! The caches below keep the outcome (sink or error) across invocations of a
//! warm function instance. Two strategies exist:
//!
//! - [`TtlClientCache`] re-resolves once the entry is older than its TTL, so
//!   a rotated secret is eventually picked up and a failure is not permanent.
//! - [`OnceClientCache`] resolves a single time for the life of the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::client::{ClientError, LogSink, NewRelicLogClient};
use crate::config::{CachePolicy, Config};
use crate::secrets::{CredentialResolver, CredentialSource, LicenseKey, SecretError};

/// Default age after which a cached sink is rebuilt.
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(600);

/// Builds a sink once the license key is known.
pub type SinkFactory =
    Arc<dyn Fn(LicenseKey) -> Result<Arc<dyn LogSink>, ClientError> + Send + Sync>;

/// Why no sink could be handed out.
///
/// Cloneable so that a cached failure can be returned to every caller.
#[derive(Debug, Clone)]
pub enum AcquireError {
    /// License key resolution failed
    Credential(Arc<SecretError>),

    /// The sink could not be constructed
    Sink(Arc<ClientError>),
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::Credential(e) => write!(f, "failed to resolve license key: {}", e),
            AcquireError::Sink(e) => write!(f, "failed to create Log API client: {}", e),
        }
    }
}

impl std::error::Error for AcquireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AcquireError::Credential(e) => Some(e.as_ref()),
            AcquireError::Sink(e) => Some(e.as_ref()),
        }
    }
}

/// Shared handle to the sink used by a run.
#[async_trait]
pub trait ClientCache: Send + Sync {
    /// Return the cached sink, resolving it first when needed.
    async fn acquire(&self) -> Result<Arc<dyn LogSink>, AcquireError>;
}

type CachedSink = Result<Arc<dyn LogSink>, AcquireError>;

/// Credential lookup followed by sink construction.
struct Resolution {
    source: Arc<dyn CredentialSource>,
    factory: SinkFactory,
    count: AtomicU64,
}

impl Resolution {
    fn new(source: Arc<dyn CredentialSource>, factory: SinkFactory) -> Self {
        Self {
            source,
            factory,
            count: AtomicU64::new(0),
        }
    }

    async fn resolve(&self) -> CachedSink {
        self.count.fetch_add(1, Ordering::SeqCst);

        let key = self.source.resolve().await.map_err(|e| {
            error!(error = %e, configuration = e.is_configuration(), "License key resolution failed");
            AcquireError::Credential(Arc::new(e))
        })?;

        (self.factory)(key).map_err(|e| {
            error!(error = %e, "Log API client construction failed");
            AcquireError::Sink(Arc::new(e))
        })
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

struct CacheEntry {
    result: CachedSink,
    cached_at: Instant,
}

/// Cache that rebuilds the sink once the entry exceeds its TTL.
///
/// Fresh entries are served under a shared read lock. A stale or missing
/// entry is rebuilt under the write lock, so concurrent callers that miss
/// together trigger a single resolution.
pub struct TtlClientCache {
    resolution: Resolution,
    ttl: Duration,
    entry: RwLock<Option<CacheEntry>>,
}

impl TtlClientCache {
    pub fn new(source: Arc<dyn CredentialSource>, factory: SinkFactory, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_CLIENT_TTL } else { ttl };
        Self {
            resolution: Resolution::new(source, factory),
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// Get the configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of resolutions performed so far.
    pub fn resolutions(&self) -> u64 {
        self.resolution.count()
    }

    /// When the current entry was resolved, if there is one.
    pub async fn cached_at(&self) -> Option<Instant> {
        self.entry.read().await.as_ref().map(|e| e.cached_at)
    }

    fn fresh(&self, entry: &Option<CacheEntry>) -> Option<CachedSink> {
        entry
            .as_ref()
            .filter(|e| e.cached_at.elapsed() < self.ttl)
            .map(|e| e.result.clone())
    }
}

#[async_trait]
impl ClientCache for TtlClientCache {
    async fn acquire(&self) -> Result<Arc<dyn LogSink>, AcquireError> {
        if let Some(result) = self.fresh(&*self.entry.read().await) {
            debug!("Using cached Log API client");
            return result;
        }

        let mut entry = self.entry.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(result) = self.fresh(&entry) {
            return result;
        }

        info!(ttl_secs = self.ttl.as_secs(), "Resolving Log API client");
        let result = self.resolution.resolve().await;
        *entry = Some(CacheEntry {
            result: result.clone(),
            cached_at: Instant::now(),
        });
        result
    }
}

/// Cache that resolves the sink exactly once per process.
pub struct OnceClientCache {
    resolution: Resolution,
    cell: OnceCell<CachedSink>,
}

impl OnceClientCache {
    pub fn new(source: Arc<dyn CredentialSource>, factory: SinkFactory) -> Self {
        Self {
            resolution: Resolution::new(source, factory),
            cell: OnceCell::new(),
        }
    }

    /// Number of resolutions performed so far (0 or 1).
    pub fn resolutions(&self) -> u64 {
        self.resolution.count()
    }
}

#[async_trait]
impl ClientCache for OnceClientCache {
    async fn acquire(&self) -> Result<Arc<dyn LogSink>, AcquireError> {
        self.cell
            .get_or_init(|| async {
                info!("Resolving Log API client for the process lifetime");
                self.resolution.resolve().await
            })
            .await
            .clone()
    }
}

/// Factory building [`NewRelicLogClient`]s for the configured endpoint.
pub fn log_api_factory(config: &Config) -> SinkFactory {
    let endpoint = config.logs_endpoint.clone();
    let timeout = config.request_timeout;

    Arc::new(move |key: LicenseKey| -> Result<Arc<dyn LogSink>, ClientError> {
        let client = NewRelicLogClient::new(endpoint.clone(), key, timeout)?;
        Ok(Arc::new(client) as Arc<dyn LogSink>)
    })
}

/// Build the process-wide cache selected by the configuration.
pub fn from_config(config: &Config) -> Arc<dyn ClientCache> {
    let source: Arc<dyn CredentialSource> = Arc::new(CredentialResolver::from_config(config));
    let factory = log_api_factory(config);

    match config.cache_policy {
        CachePolicy::Ttl => Arc::new(TtlClientCache::new(source, factory, config.client_ttl)),
        CachePolicy::Once => Arc::new(OnceClientCache::new(source, factory)),
    }
}
