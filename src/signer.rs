//! OCI HTTP signatures for resource principal sessions.
//!
//! Requests to OCI services carry an `Authorization: Signature ...` header.
//! The signature is RSA-SHA256 over the `date`, `(request-target)` and `host`
//! headers, made with the resource principal private key. The key id is the
//! session token prefixed with `ST$`.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;

use crate::secrets::SecretError;

/// Headers covered by the signature, in signing order.
const SIGNED_HEADERS: &str = "date (request-target) host";

/// Signs requests on behalf of a resource principal.
pub struct RequestSigner {
    key_id: String,
    signing_key: SigningKey<Sha256>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Build a signer from a session token and a PEM private key (PKCS#1 or
    /// PKCS#8).
    pub fn new(session_token: &str, private_key_pem: &str) -> Result<Self, SecretError> {
        let session_token = session_token.trim();
        if session_token.is_empty() {
            return Err(SecretError::Provider(
                "resource principal session token is empty".to_string(),
            ));
        }

        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| {
                SecretError::Provider(format!("invalid resource principal private key: {}", e))
            })?;

        Ok(Self {
            key_id: format!("ST${}", session_token),
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Build a signer from the resource principal environment values.
    ///
    /// Each value is either the content itself or an absolute path to a file
    /// holding it.
    pub fn from_resource_principal(
        session_token: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<Self, SecretError> {
        let session_token = session_token.ok_or_else(|| {
            SecretError::Provider("resource principal session token is not set".to_string())
        })?;
        let private_key = private_key.ok_or_else(|| {
            SecretError::Provider("resource principal private key is not set".to_string())
        })?;

        Self::new(&read_value(session_token)?, &read_value(private_key)?)
    }

    /// Key id announced in the signature.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// `Authorization` header value for a request sent with `date`.
    pub fn authorization(
        &self,
        method: &Method,
        url: &Url,
        date: &str,
    ) -> Result<String, SecretError> {
        let signing_string = signing_string(method, url, date)?;
        let signature = self
            .signing_key
            .try_sign(signing_string.as_bytes())
            .map_err(|e| SecretError::Provider(format!("failed to sign request: {}", e)))?;

        Ok(format!(
            r#"Signature version="1",keyId="{}",algorithm="rsa-sha256",headers="{}",signature="{}""#,
            self.key_id,
            SIGNED_HEADERS,
            STANDARD.encode(signature.to_bytes())
        ))
    }
}

/// The text that gets signed for a request.
pub fn signing_string(method: &Method, url: &Url, date: &str) -> Result<String, SecretError> {
    let host = host_header(url)
        .ok_or_else(|| SecretError::Provider(format!("request URL has no host: {}", url)))?;

    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    Ok(format!(
        "date: {}\n(request-target): {} {}\nhost: {}",
        date,
        method.as_str().to_ascii_lowercase(),
        target,
        host
    ))
}

/// `Date` header value in RFC 7231 format.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Host as sent in the `Host` header; the port only appears when it is not
/// the scheme default.
fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn read_value(raw: &str) -> Result<String, SecretError> {
    if Path::new(raw).is_absolute() {
        std::fs::read_to_string(raw)
            .map(|content| content.trim().to_string())
            .map_err(|e| SecretError::Provider(format!("failed to read {}: {}", raw, e)))
    } else {
        Ok(raw.to_string())
    }
}
