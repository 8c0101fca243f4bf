use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use itertools::Itertools;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::InsightError;
use crate::models::{LookupKey, NormalizedPackageData};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/package/{*path}", get(package_insight))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Splits `ecosystem/name.../version`. Everything between the first and last
/// segment is the name, so scoped names like `@types/node` survive whether or
/// not the browser encoded the slash.
fn parse_package_path(path: &str) -> Result<LookupKey, InsightError> {
    let segments: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    match segments.as_slice() {
        [ecosystem, name @ .., version] if !name.is_empty() => {
            LookupKey::new(ecosystem, &name.iter().join("/"), version)
        }
        _ => Err(InsightError::MissingParameters),
    }
}

/// GET /api/package/{ecosystem}/{name}/{version} - Normalized package insight.
pub async fn package_insight(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Json<NormalizedPackageData>, InsightError> {
    let key = parse_package_path(&path)?;

    match state.lookup(&key).await {
        Ok(data) => Ok(Json(data)),
        Err(e) => {
            match &e {
                InsightError::NotFound { .. } => info!("No insight for {}", key.identity()),
                InsightError::Unavailable(details) => {
                    warn!("Insights service unavailable for {}: {}", key.identity(), details)
                }
                other => error!(
                    "Lookup of {} failed: {} ({})",
                    key.identity(),
                    other,
                    other.details().unwrap_or_default()
                ),
            }
            Err(e)
        }
    }
}

/// GET /health - Liveness plus which collaborators are wired up.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "upstream_configured": state.insights.is_configured(),
        "cache_enabled": state.cache.is_enabled(),
    }))
}
