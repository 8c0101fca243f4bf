//! Client for the SafeDep insights service.
//!
//! The service is reached over the Connect protocol (unary calls, JSON codec,
//! HTTP/1.1). One call per lookup, no retries; the caller decides whether an
//! `Unavailable` is worth repeating.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::InsightError;
use crate::models::{InsightResponse, LookupKey, RawInsight};

pub const DEFAULT_BASE_URL: &str = "https://api.safedep.io";
const INSIGHT_METHOD: &str = "safedep.services.insights.v2.InsightService/GetPackageVersionInsight";
const TENANT_HEADER: &str = "x-tenant-id";
const CONNECT_VERSION_HEADER: &str = "connect-protocol-version";

/// Bearer token and tenant identifier for the insights service.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub tenant_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Anything that can produce a raw insight for a package version.
#[async_trait]
pub trait InsightSource: Send + Sync {
    async fn fetch(&self, key: &LookupKey) -> Result<RawInsight, InsightError>;

    /// Whether calls can be attempted at all.
    fn is_configured(&self) -> bool {
        true
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsightRequest<'a> {
    package_version: PackageVersion<'a>,
}

#[derive(Debug, Serialize)]
struct PackageVersion<'a> {
    package: Package<'a>,
    version: &'a str,
}

#[derive(Debug, Serialize)]
struct Package<'a> {
    ecosystem: &'static str,
    name: &'a str,
}

/// Error body of a failed Connect call.
#[derive(Debug, Deserialize)]
struct ConnectError {
    code: String,
    #[serde(default)]
    message: String,
}

/// Insights service client. Holds no connection state beyond reqwest's pool,
/// so it is shared freely between requests.
#[derive(Debug, Clone)]
pub struct SafeDepClient {
    client: reqwest::Client,
    endpoint: String,
    headers: Option<HeaderMap>,
}

impl SafeDepClient {
    /// Builds the client. Without credentials every `fetch` fails with
    /// `NotConfigured` before touching the network.
    pub fn new(base_url: &str, credentials: Option<Credentials>) -> Result<Self, InsightError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pkginsight/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InsightError::Unknown(format!("failed to build HTTP client: {e}")))?;

        let headers = credentials.map(|c| auth_headers(&c)).transpose()?;

        Ok(Self {
            client,
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), INSIGHT_METHOD),
            headers,
        })
    }
}

fn auth_headers(credentials: &Credentials) -> Result<HeaderMap, InsightError> {
    let invalid = |what: &str| InsightError::Unknown(format!("invalid {what} header value"));

    let mut bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.api_key))
        .map_err(|_| invalid("authorization"))?;
    bearer.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(
        TENANT_HEADER,
        HeaderValue::from_str(&credentials.tenant_id).map_err(|_| invalid("tenant"))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONNECT_VERSION_HEADER, HeaderValue::from_static("1"));
    Ok(headers)
}

#[async_trait]
impl InsightSource for SafeDepClient {
    async fn fetch(&self, key: &LookupKey) -> Result<RawInsight, InsightError> {
        let headers = self.headers.clone().ok_or(InsightError::NotConfigured)?;

        let request = InsightRequest {
            package_version: PackageVersion {
                package: Package {
                    ecosystem: key.ecosystem.upstream_name(),
                    name: &key.name,
                },
                version: &key.version,
            },
        };

        debug!("Requesting insight for {}", key.identity());
        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body, key));
        }

        let body: InsightResponse = response
            .json()
            .await
            .map_err(|e| InsightError::Unknown(format!("invalid insight response: {e}")))?;

        match body.insight {
            Some(insight) if !insight.is_empty() => Ok(insight),
            _ => Err(not_found(key, "No insight data available for this package version")),
        }
    }

    fn is_configured(&self) -> bool {
        self.headers.is_some()
    }
}

fn not_found(key: &LookupKey, details: impl Into<String>) -> InsightError {
    InsightError::NotFound {
        package: key.identity(),
        details: details.into(),
    }
}

fn transport_error(e: reqwest::Error) -> InsightError {
    if e.is_connect() || e.is_timeout() {
        warn!("Insights service unreachable: {}", e);
        InsightError::Unavailable(e.to_string())
    } else {
        InsightError::Unknown(e.to_string())
    }
}

/// Translates a non-2xx answer. The Connect error code decides when the body
/// carries one, otherwise the HTTP status does.
fn upstream_error(status: StatusCode, body: &str, key: &LookupKey) -> InsightError {
    let (code, message) = match serde_json::from_str::<ConnectError>(body) {
        Ok(err) => (err.code, err.message),
        Err(_) => (String::new(), format!("HTTP {status}: {body}")),
    };

    match (code.as_str(), status.as_u16()) {
        ("not_found", _) | ("", 404) => not_found(key, message),
        ("unavailable", _) | ("", 502..=504) => InsightError::Unavailable(message),
        ("unauthenticated" | "permission_denied", _) | ("", 401 | 403) => {
            InsightError::Unauthenticated(message)
        }
        ("", _) => InsightError::Unknown(message),
        (code, _) => InsightError::Unknown(format!("{code}: {message}")),
    }
}
