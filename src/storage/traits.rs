//! Audit sink abstraction
//!
//! The model pool and the enrichment service report lifecycle and batch
//! events here. Implementations can be swapped between plain logging,
//! an in-memory buffer and SQLite.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::ReloadReason;

/// Summary emitted once per non-empty enrichment batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub detections: usize,
    /// Error count per pipeline category, e.g. `{"vehicle": 2}`
    pub category_error_counts: BTreeMap<String, usize>,
    pub processing_time_ms: u64,
}

/// Events reported to the audit sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ModelLoaded { model: String, duration_ms: u64 },
    ModelFreed { model: String, memory_cost: u64 },
    ModelRestarted { model: String, reason: ReloadReason },
    BatchCompleted(BatchSummary),
}

impl AuditEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AuditEvent::ModelLoaded { .. } => "model_loaded",
            AuditEvent::ModelFreed { .. } => "model_freed",
            AuditEvent::ModelRestarted { .. } => "model_restarted",
            AuditEvent::BatchCompleted(_) => "batch_completed",
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            AuditEvent::ModelLoaded { model, .. }
            | AuditEvent::ModelFreed { model, .. }
            | AuditEvent::ModelRestarted { model, .. } => Some(model),
            AuditEvent::BatchCompleted(_) => None,
        }
    }
}

/// Audit sink trait
/// Implementations must be thread-safe and async-compatible
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Record an event, logging instead of propagating sink failures.
pub async fn record_or_warn(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event).await {
        warn!("Audit sink rejected {} event: {}", event.event_type(), e);
    }
}

/// Sink that only writes events to the log.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        match event {
            AuditEvent::ModelLoaded { model, duration_ms } => {
                info!("audit: {} loaded in {}ms", model, duration_ms)
            }
            AuditEvent::ModelFreed { model, memory_cost } => {
                info!("audit: {} freed {} memory units", model, memory_cost)
            }
            AuditEvent::ModelRestarted { model, reason } => {
                info!("audit: {} restarted ({})", model, reason)
            }
            AuditEvent::BatchCompleted(summary) => info!(
                "audit: batch {} with {} detections finished in {}ms, errors {:?}",
                summary.batch_id,
                summary.detections,
                summary.processing_time_ms,
                summary.category_error_counts
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = AuditEvent::ModelRestarted {
            model: "plate_ocr".to_string(),
            reason: ReloadReason::Oom,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "model_restarted");
        assert_eq!(json["reason"], "oom");
        assert_eq!(event.model(), Some("plate_ocr"));
    }

    #[test]
    fn test_batch_summary_flattens_into_event() {
        let mut counts = BTreeMap::new();
        counts.insert("vehicle".to_string(), 1);
        let event = AuditEvent::BatchCompleted(BatchSummary {
            batch_id: Uuid::nil(),
            detections: 3,
            category_error_counts: counts,
            processing_time_ms: 12,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "batch_completed");
        assert_eq!(json["detections"], 3);
        assert_eq!(json["category_error_counts"]["vehicle"], 1);
        assert!(event.model().is_none());
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_everything() {
        let sink = TracingSink;
        let event = AuditEvent::ModelFreed { model: "x".into(), memory_cost: 10 };
        assert!(sink.record(&event).await.is_ok());
    }
}
