//! Axum REST API handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::engine::{ModelPool, PoolStatus, UnloadReport};
use crate::error::{EnrichError, PoolError};
use crate::service::{Detection, EnrichmentResult, EnrichmentService, ImageMap};
use crate::storage::{AuditRecord, SqliteAuditSink};
use crate::utils::image::decode_image;

use super::dto::*;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<EnrichmentService>,
    pub pool: Arc<ModelPool>,
    /// Present when audit events are persisted
    pub audit: Option<Arc<SqliteAuditSink>>,
    pub start_time: Instant,
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Enrichment
        .route("/api/v1/enrich", post(enrich_handler))
        // Model lifecycle
        .route("/api/v1/models", get(models_handler))
        .route("/api/v1/models/unload", post(unload_all_handler))
        .route("/api/v1/models/:name/unload", post(unload_handler))
        .route("/api/v1/models/:name/reload", post(reload_handler))
        // Audit trail
        .route("/api/v1/audit/recent", get(recent_audit_handler))
        // System endpoints
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50MB limit for frame batches
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_error(status: StatusCode, message: &str, code: &str) -> ApiError {
    (status, Json(ErrorResponse::new(message, code)))
}

/// HTTP status and error code for a pool error
pub fn pool_error_status(err: &PoolError) -> (StatusCode, &'static str) {
    match err {
        PoolError::UnknownModel { .. } => (StatusCode::NOT_FOUND, "UNKNOWN_MODEL"),
        PoolError::ModelDisabled { .. } => (StatusCode::CONFLICT, "MODEL_DISABLED"),
        PoolError::InvalidReloadReason { .. } => (StatusCode::BAD_REQUEST, "INVALID_REASON"),
        PoolError::LoadFailure { .. } => (StatusCode::SERVICE_UNAVAILABLE, "LOAD_FAILED"),
        PoolError::DoubleRelease { .. } | PoolError::NotLoaded { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "RELEASE_MISMATCH")
        }
    }
}

/// HTTP status and error code for a failed enrichment call
pub fn enrich_error_status(err: &EnrichError) -> (StatusCode, &'static str) {
    match err {
        EnrichError::InvalidDetection { .. } | EnrichError::DuplicateDetection { .. } => {
            (StatusCode::BAD_REQUEST, "INVALID_DETECTION")
        }
        // The routing table names a model the registry cannot serve
        EnrichError::Pool(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MODEL_MISCONFIGURED"),
    }
}

/// Enrich a batch of detections.
///
/// Multipart fields: `detections` holds the JSON array, every `image` field
/// carries one frame keyed by its file name.
async fn enrich_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<EnrichmentResult>, ApiError> {
    let mut detections: Option<Vec<Detection>> = None;
    let mut images = ImageMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, &e.to_string(), "MULTIPART_ERROR"))?
    {
        let name = field.name().unwrap_or("").to_string();

        if name == "detections" {
            let text = field
                .text()
                .await
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, &e.to_string(), "READ_ERROR"))?;
            detections = Some(serde_json::from_str(&text).map_err(|e| {
                api_error(StatusCode::BAD_REQUEST, &e.to_string(), "INVALID_DETECTIONS")
            })?);
        } else if name == "image" {
            let image_ref = field
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("image{}", images.len()));
            let data = field
                .bytes()
                .await
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, &e.to_string(), "READ_ERROR"))?;
            let image = decode_image(&data).map_err(|e| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    &format!("{}: {}", image_ref, e),
                    "INVALID_IMAGE",
                )
            })?;
            images.insert(image_ref, image);
        }
    }

    let detections = detections.ok_or_else(|| {
        api_error(StatusCode::BAD_REQUEST, "Missing detections field", "MISSING_DETECTIONS")
    })?;
    let images = if images.is_empty() { None } else { Some(&images) };

    let result = state
        .service
        .enrich_batch(&detections, images)
        .await
        .map_err(|e| {
            error!("Enrichment failed: {}", e);
            let (status, code) = enrich_error_status(&e);
            api_error(status, &e.to_string(), code)
        })?;

    Ok(Json(result))
}

/// Pool status snapshot
async fn models_handler(State(state): State<Arc<AppState>>) -> Json<PoolStatus> {
    Json(state.pool.get_status())
}

async fn unload_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<UnloadResponse>, ApiError> {
    if state.pool.registry().get(&name).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            &format!("Unknown model: {}", name),
            "UNKNOWN_MODEL",
        ));
    }

    let unloaded = state.pool.unload(&name).await;
    Ok(Json(UnloadResponse {
        ref_count: state.pool.ref_count(&name),
        model: name,
        unloaded,
    }))
}

async fn unload_all_handler(State(state): State<Arc<AppState>>) -> Json<UnloadReport> {
    Json(state.pool.unload_all().await)
}

async fn reload_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ReloadRequest>,
) -> Result<Json<ReloadResponse>, ApiError> {
    state.pool.reload(&name, &req.reason).await.map_err(|e| {
        error!("Reload of {} failed: {}", name, e);
        let (status, code) = pool_error_status(&e);
        api_error(status, &e.to_string(), code)
    })?;

    info!("Model {} reloaded ({})", name, req.reason);
    Ok(Json(ReloadResponse {
        ref_count: state.pool.ref_count(&name),
        model: name,
        reason: req.reason,
    }))
}

/// Recent audit events, newest first
async fn recent_audit_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let audit = state.audit.as_ref().ok_or_else(|| {
        api_error(StatusCode::NOT_FOUND, "Audit storage is disabled", "AUDIT_DISABLED")
    })?;
    let limit = query.limit.unwrap_or(20).clamp(1, 500);

    let records = audit
        .recent(limit, query.event_type.as_deref())
        .await
        .map_err(|e| {
            error!("Failed to list audit events: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), "LIST_FAILED")
        })?;

    Ok(Json(records))
}

/// Health check
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = state.pool.get_status();

    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        models_loaded: status.loaded_names,
    })
}

/// Metrics
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let status = state.pool.get_status();
    let audit_events = match &state.audit {
        Some(audit) => audit.count().await.ok(),
        None => None,
    };

    Json(MetricsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        models_loaded: status.loaded_names.len(),
        total_loaded_cost: status.total_loaded_cost,
        memory_budget: status.memory_budget,
        over_budget: status.over_budget,
        total_acquires: status.total_acquires,
        audit_events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_status() {
        let reason = PoolError::InvalidReloadReason { reason: "bogus".into() };
        assert_eq!(pool_error_status(&reason).0, StatusCode::BAD_REQUEST);

        let unknown = PoolError::UnknownModel { name: "x".into() };
        assert_eq!(pool_error_status(&unknown), (StatusCode::NOT_FOUND, "UNKNOWN_MODEL"));
    }

    #[test]
    fn test_enrich_error_status() {
        let dup = EnrichError::DuplicateDetection { id: "d1".into() };
        assert_eq!(enrich_error_status(&dup).0, StatusCode::BAD_REQUEST);

        let pool = EnrichError::from(PoolError::ModelDisabled { name: "plate_ocr".into() });
        assert_eq!(enrich_error_status(&pool).0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
