//! Error types for the package insight proxy.
//!
//! `InsightError` is the caller-facing taxonomy: every failure of a lookup
//! ends up as one of its variants, which in turn maps onto exactly one HTTP
//! status. Cache failures live in their own `CacheError` type because they
//! are swallowed before they can reach a caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures of a package lookup.
///
/// Client-input variants (`MissingParameters`, `UnsupportedEcosystem`) are
/// raised before any outbound call is made.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InsightError {
    #[error("Missing required parameters: ecosystem, name, and version are required")]
    MissingParameters,

    #[error("Unsupported ecosystem: {0}. Supported ecosystems: npm, pypi, maven, cargo, nuget, go")]
    UnsupportedEcosystem(String),

    #[error("SafeDep API client not configured")]
    NotConfigured,

    /// `package` is the `ecosystem/name@version` identity of the lookup.
    #[error("Package not found: {package}")]
    NotFound { package: String, details: String },

    #[error("Insights service unavailable")]
    Unavailable(String),

    #[error("Insights service rejected the configured credentials")]
    Unauthenticated(String),

    #[error("Failed to fetch package data from SafeDep API")]
    Unknown(String),
}

impl InsightError {
    pub fn status(&self) -> StatusCode {
        match self {
            InsightError::MissingParameters | InsightError::UnsupportedEcosystem(_) => {
                StatusCode::BAD_REQUEST
            }
            InsightError::NotFound { .. } => StatusCode::NOT_FOUND,
            InsightError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            InsightError::NotConfigured
            | InsightError::Unauthenticated(_)
            | InsightError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable diagnostics, distinct from the `Display` summary.
    ///
    /// Client-input errors carry no details.
    pub fn details(&self) -> Option<String> {
        match self {
            InsightError::MissingParameters | InsightError::UnsupportedEcosystem(_) => None,
            InsightError::NotConfigured => Some(
                "Set SAFEDEP_API_KEY and SAFEDEP_TENANT_ID in the environment or .env".to_string(),
            ),
            InsightError::NotFound { details, .. } => Some(details.clone()),
            InsightError::Unavailable(details)
            | InsightError::Unauthenticated(details)
            | InsightError::Unknown(details) => Some(details.clone()),
        }
    }
}

/// JSON body sent to the browser for every failed lookup.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for InsightError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Failures talking to the cache backend. Never surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl CacheError {
    /// True when the connection that produced this error should be dropped.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            CacheError::Redis(e) => {
                e.kind() == redis::ErrorKind::IoError
                    || e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            CacheError::Timeout { .. } => true,
        }
    }
}
