//! License key resolution.
//!
//! The key comes from the `LICENSE_KEY` override when set, otherwise from an
//! OCI Vault secret. Vault secrets are base64 transported and may hold either
//! the bare key or a JSON object with a `licenseKey` field.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, DATE};
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::config::Config;
use crate::signer::{http_date, RequestSigner};

/// JSON field holding the key inside a structured secret.
pub const LICENSE_KEY_FIELD: &str = "licenseKey";

/// Secrets API version path segment.
const SECRETS_API_VERSION: &str = "20190301";

/// Opaque credential sent to the Log API.
#[derive(Clone, PartialEq, Eq)]
pub struct LicenseKey(String);

impl LicenseKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for LicenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LicenseKey(****)")
    }
}

/// Errors raised while resolving the license key.
#[derive(Debug)]
pub enum SecretError {
    /// No secret OCID configured
    MissingSecretId,

    /// No vault region configured
    MissingVaultRegion,

    /// The vault client or its credentials provider could not be created
    Provider(String),

    /// The vault request failed
    Fetch(String),

    /// The vault answered with something other than base64 content
    UnexpectedContent(String),

    /// The secret content could not be decoded
    Decode(String),

    /// The decoded secret is empty
    EmptySecret,

    /// The secret is JSON but carries no usable `licenseKey`
    MissingLicenseKey,
}

impl SecretError {
    /// Whether the failure stems from deployment configuration rather than
    /// the vault service.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SecretError::MissingSecretId
                | SecretError::MissingVaultRegion
                | SecretError::Provider(_)
        )
    }
}

impl std::fmt::Display for SecretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretError::MissingSecretId => write!(f, "secret OCID is empty"),
            SecretError::MissingVaultRegion => write!(f, "vault region is empty"),
            SecretError::Provider(e) => write!(f, "failed to create OCI secrets client: {}", e),
            SecretError::Fetch(e) => write!(f, "failed to fetch secret bundle: {}", e),
            SecretError::UnexpectedContent(e) => write!(f, "unexpected secret content: {}", e),
            SecretError::Decode(e) => write!(f, "failed to decode secret content: {}", e),
            SecretError::EmptySecret => write!(f, "license key secret is empty"),
            SecretError::MissingLicenseKey => {
                write!(f, "license key is empty or not present in the secret")
            }
        }
    }
}

impl std::error::Error for SecretError {}

/// A vault holding base64-encoded secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the base64 content of a secret.
    async fn fetch_secret(&self, secret_id: &str, region: &str) -> Result<String, SecretError>;
}

/// Builds a vault client on demand.
pub type StoreConnector =
    Arc<dyn Fn() -> Result<Arc<dyn SecretStore>, SecretError> + Send + Sync>;

/// Anything able to produce the license key.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self) -> Result<LicenseKey, SecretError>;
}

/// Resolves the license key from the override or the vault.
pub struct CredentialResolver {
    license_key: Option<String>,
    secret_id: Option<String>,
    vault_region: Option<String>,
    connector: StoreConnector,
}

impl CredentialResolver {
    pub fn new(
        license_key: Option<String>,
        secret_id: Option<String>,
        vault_region: Option<String>,
        connector: StoreConnector,
    ) -> Self {
        Self {
            license_key: license_key.filter(|k| !k.is_empty()),
            secret_id,
            vault_region,
            connector,
        }
    }

    /// Resolver wired to the OCI Vault described by the configuration.
    pub fn from_config(config: &Config) -> Self {
        let endpoint = config.vault_endpoint.clone();
        let token = config.resource_principal_token.clone();
        let private_key = config.resource_principal_private_key.clone();
        let timeout = config.request_timeout;

        let connector: StoreConnector =
            Arc::new(move || -> Result<Arc<dyn SecretStore>, SecretError> {
                let signer = RequestSigner::from_resource_principal(
                    token.as_deref(),
                    private_key.as_deref(),
                )
                .map_err(|e| {
                    error!(error = %e, "Failed to create resource principal configuration provider");
                    e
                })?;
                let client = OciVaultClient::new(endpoint.clone(), signer, timeout)?;
                Ok(Arc::new(client))
            });

        Self::new(
            config.license_key.clone(),
            config.secret_id.clone(),
            config.vault_region.clone(),
            connector,
        )
    }
}

#[async_trait]
impl CredentialSource for CredentialResolver {
    async fn resolve(&self) -> Result<LicenseKey, SecretError> {
        if let Some(key) = &self.license_key {
            debug!("Using license key from environment variable");
            return Ok(LicenseKey::new(key.clone()));
        }

        debug!("Fetching license key from OCI vault");

        let secret_id = self
            .secret_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SecretError::MissingSecretId)?;
        let region = self
            .vault_region
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SecretError::MissingVaultRegion)?;

        let store = (self.connector)()?;
        let encoded = store.fetch_secret(secret_id, region).await?;
        let secret = decode_secret(&encoded)?;

        extract_license_key(&secret)
    }
}

/// Decode the base64 transport encoding of a secret.
pub fn decode_secret(encoded: &str) -> Result<String, SecretError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SecretError::Decode(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| SecretError::Decode(e.to_string()))
}

/// Pick the license key out of a decoded secret.
///
/// JSON objects must carry a non-empty `licenseKey` string; any other
/// content is taken verbatim.
pub fn extract_license_key(secret: &str) -> Result<LicenseKey, SecretError> {
    if secret.is_empty() {
        return Err(SecretError::EmptySecret);
    }

    match serde_json::from_str::<Map<String, Value>>(secret) {
        Ok(fields) => match fields.get(LICENSE_KEY_FIELD).and_then(Value::as_str) {
            Some(key) if !key.is_empty() => Ok(LicenseKey::new(key)),
            _ => Err(SecretError::MissingLicenseKey),
        },
        Err(_) => Ok(LicenseKey::new(secret)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretBundle {
    secret_bundle_content: Option<SecretBundleContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretBundleContent {
    content_type: String,
    content: Option<String>,
}

/// Client for the OCI Vault secret bundles API.
pub struct OciVaultClient {
    client: Client,
    endpoint: Option<String>,
    signer: RequestSigner,
}

impl OciVaultClient {
    /// Create a vault client whose requests are signed by `signer`.
    /// `endpoint` overrides the regional secrets endpoint.
    pub fn new(
        endpoint: Option<String>,
        signer: RequestSigner,
        timeout: Duration,
    ) -> Result<Self, SecretError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SecretError::Provider(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            signer,
        })
    }

    fn bundle_url(&self, secret_id: &str, region: &str) -> String {
        let base = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://secrets.vaults.{}.oci.oraclecloud.com", region),
        };
        format!("{}/{}/secretbundles/{}", base, SECRETS_API_VERSION, secret_id)
    }
}

#[async_trait]
impl SecretStore for OciVaultClient {
    async fn fetch_secret(&self, secret_id: &str, region: &str) -> Result<String, SecretError> {
        if secret_id.is_empty() {
            return Err(SecretError::MissingSecretId);
        }
        if region.is_empty() {
            return Err(SecretError::MissingVaultRegion);
        }

        let url = Url::parse(&self.bundle_url(secret_id, region))
            .map_err(|e| SecretError::Provider(format!("invalid vault endpoint: {}", e)))?;
        let date = http_date(Utc::now());
        let authorization = self.signer.authorization(&Method::GET, &url, &date)?;

        let response = self
            .client
            .get(url)
            .header(DATE, date)
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| SecretError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Fetch(format!("status {}: {}", status, body)));
        }

        let bundle: SecretBundle = response
            .json()
            .await
            .map_err(|e| SecretError::Fetch(e.to_string()))?;
        debug!("Successfully fetched secret from OCI vault");

        let content = bundle.secret_bundle_content.ok_or_else(|| {
            SecretError::UnexpectedContent("secret bundle has no content".to_string())
        })?;
        if !content.content_type.eq_ignore_ascii_case("BASE64") {
            error!(secret_id = %secret_id, content_type = %content.content_type, "Unexpected secret content type");
            return Err(SecretError::UnexpectedContent(format!(
                "content type {}",
                content.content_type
            )));
        }

        content
            .content
            .ok_or_else(|| SecretError::UnexpectedContent("secret content is nil".to_string()))
    }
}
