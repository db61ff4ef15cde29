//! Identity providers: device fingerprint and IP geolocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Session;

/// Error types for identity lookups.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The client did not report a device fingerprint
    #[error("No fingerprint reported for session {0}")]
    MissingFingerprint(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Network metadata for an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub ip: String,
    pub country: Option<String>,
    pub isp: Option<String>,
}

/// Source of device and network identity.
///
/// Both lookups are single-shot. Callers bound them with a timeout and
/// never retry.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Stable device identifier for the session.
    async fn fingerprint(&self, session: &Session) -> Result<String, ProviderError>;

    /// Country and ISP for an address.
    async fn geolocate(&self, ip: &str) -> Result<GeoInfo, ProviderError>;
}

/// Production provider.
///
/// The fingerprint is the visitor id computed client-side and sent with the
/// session; geolocation calls an ipinfo-style JSON endpoint.
pub struct HttpIdentityProvider {
    client: Client,
    url_template: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    ip: Option<String>,
    country: Option<String>,
    /// e.g. "AS3320 Deutsche Telekom AG"
    org: Option<String>,
}

impl HttpIdentityProvider {
    /// `url_template` must contain `{ip}`.
    pub fn new(url_template: impl Into<String>, token: Option<String>) -> Result<Self, ProviderError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::RequestFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url_template: url_template.into(),
            token,
        })
    }

    fn geo_url(&self, ip: &str) -> String {
        self.url_template.replace("{ip}", ip)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    fn id(&self) -> &str {
        "http"
    }

    async fn fingerprint(&self, session: &Session) -> Result<String, ProviderError> {
        session
            .visitor_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::MissingFingerprint(session.session_id.clone()))
    }

    async fn geolocate(&self, ip: &str) -> Result<GeoInfo, ProviderError> {
        let mut request = self.client.get(self.geo_url(ip));
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::RequestFailed(format!(
                "HTTP {} for {}",
                response.status(),
                ip
            )));
        }

        let geo: GeoResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        debug!(ip = %ip, country = ?geo.country, "geolocated");
        Ok(GeoInfo {
            ip: geo.ip.unwrap_or_else(|| ip.to_string()),
            country: geo.country,
            isp: geo.org,
        })
    }
}

/// Provider with fixed answers, for tests and offline runs.
///
/// Fingerprints come from the session's visitor id. Addresses without an
/// explicit entry resolve to the default country with no ISP.
pub struct StaticIdentityProvider {
    geo: HashMap<String, GeoInfo>,
    default_country: Option<String>,
    fail_fingerprint: bool,
    fail_geolocate: bool,
    delay: Option<Duration>,
    call_count: AtomicU32,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self {
            geo: HashMap::new(),
            default_country: None,
            fail_fingerprint: false,
            fail_geolocate: false,
            delay: None,
            call_count: AtomicU32::new(0),
        }
    }

    pub fn with_default_country(mut self, country: impl Into<String>) -> Self {
        self.default_country = Some(country.into());
        self
    }

    pub fn with_geo(mut self, ip: &str, country: &str, isp: &str) -> Self {
        self.geo.insert(
            ip.to_string(),
            GeoInfo {
                ip: ip.to_string(),
                country: Some(country.to_string()),
                isp: Some(isp.to_string()),
            },
        );
        self
    }

    /// Make every fingerprint lookup fail.
    pub fn failing_fingerprint(mut self) -> Self {
        self.fail_fingerprint = true;
        self
    }

    /// Make every geolocation lookup fail.
    pub fn failing_geolocate(mut self) -> Self {
        self.fail_geolocate = true;
        self
    }

    /// Stall each lookup.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of lookups served.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn tick(&self) {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn id(&self) -> &str {
        "static"
    }

    async fn fingerprint(&self, session: &Session) -> Result<String, ProviderError> {
        self.tick().await;
        if self.fail_fingerprint {
            return Err(ProviderError::NetworkError("fingerprint service down".to_string()));
        }
        session
            .visitor_id
            .clone()
            .ok_or_else(|| ProviderError::MissingFingerprint(session.session_id.clone()))
    }

    async fn geolocate(&self, ip: &str) -> Result<GeoInfo, ProviderError> {
        self.tick().await;
        if self.fail_geolocate {
            return Err(ProviderError::NetworkError("geolocation service down".to_string()));
        }
        Ok(self.geo.get(ip).cloned().unwrap_or_else(|| GeoInfo {
            ip: ip.to_string(),
            country: self.default_country.clone(),
            isp: None,
        }))
    }
}
