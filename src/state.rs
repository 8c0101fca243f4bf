use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::{
    cache_aside, RedisCacheStore, ResponseCache, DEFAULT_REDIS_TIMEOUT, DEFAULT_TTL,
};
use crate::error::InsightError;
use crate::fetcher::{Credentials, InsightSource, SafeDepClient, DEFAULT_BASE_URL};
use crate::models::{LookupKey, NormalizedPackageData};
use crate::normalize::normalize;

/// Application configuration from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind_address: String,
    /// Base endpoint of the insights service.
    pub base_url: String,
    /// `None` unless both the API key and the tenant id are set.
    pub credentials: Option<Credentials>,
    /// Cache connection URL; `None` disables caching.
    pub redis_url: Option<String>,
    pub cache_ttl: Duration,
    /// Upper bound on dialling Redis and on each cache command.
    pub redis_timeout: Duration,
}

impl Config {
    /// Creates Config from environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Empty values count as unset.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let credentials = match (var("SAFEDEP_API_KEY"), var("SAFEDEP_TENANT_ID")) {
            (Some(api_key), Some(tenant_id)) => Some(Credentials { api_key, tenant_id }),
            _ => None,
        };

        let cache_ttl = var("CACHE_TTL_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TTL);

        let redis_timeout = var("REDIS_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REDIS_TIMEOUT);

        Self {
            bind_address: var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8201".into()),
            base_url: var("SAFEDEP_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            credentials,
            redis_url: var("REDIS_URL"),
            cache_ttl,
            redis_timeout,
        }
    }
}

/// Shared application state passed to all request handlers.
///
/// Both external clients are built once here and released through
/// [`AppState::shutdown`].
pub struct AppState {
    pub insights: Arc<dyn InsightSource>,
    pub cache: ResponseCache,
}

impl AppState {
    pub fn new(insights: Arc<dyn InsightSource>, cache: ResponseCache) -> Self {
        Self { insights, cache }
    }

    pub fn from_config(config: &Config) -> Result<Self, InsightError> {
        if config.credentials.is_none() {
            warn!("Missing SafeDep API credentials. Set SAFEDEP_API_KEY and SAFEDEP_TENANT_ID");
        }
        let insights = SafeDepClient::new(&config.base_url, config.credentials.clone())?;

        let cache = match config.redis_url.as_deref() {
            None => {
                warn!("REDIS_URL not set - caching will be disabled");
                ResponseCache::disabled()
            }
            Some(url) => match RedisCacheStore::new(url) {
                Ok(store) => {
                    let store = store.with_timeout(config.redis_timeout);
                    ResponseCache::new(Arc::new(store), config.cache_ttl)
                }
                Err(e) => {
                    warn!("Invalid REDIS_URL, caching disabled: {}", e);
                    ResponseCache::disabled()
                }
            },
        };

        Ok(Self::new(Arc::new(insights), cache))
    }

    /// Cache check, then one upstream call on a miss, then normalization.
    pub async fn lookup(&self, key: &LookupKey) -> Result<NormalizedPackageData, InsightError> {
        cache_aside(&self.cache, key, || async {
            let raw = self.insights.fetch(key).await?;
            Ok(normalize(raw, key))
        })
        .await
    }

    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}
