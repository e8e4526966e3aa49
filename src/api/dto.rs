//! API Data Transfer Objects

use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: Vec<String>,
}

/// Metrics response
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub uptime_seconds: u64,
    pub models_loaded: usize,
    pub total_loaded_cost: u64,
    pub memory_budget: u64,
    pub over_budget: bool,
    pub total_acquires: u64,
    pub audit_events: Option<i64>,
}

/// Body of `POST /api/v1/models/:name/reload`
#[derive(Debug, Deserialize)]
pub struct ReloadRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub model: String,
    pub reason: String,
    pub ref_count: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct UnloadResponse {
    pub model: String,
    pub unloaded: bool,
    pub ref_count: Option<u32>,
}

/// Query parameters for recent audit events
#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
    pub event_type: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}
