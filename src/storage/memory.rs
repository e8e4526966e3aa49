//! In-process audit buffer

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{AuditEvent, AuditSink};

/// Keeps every recorded event in memory. Useful for tests and for
/// short-lived tools that inspect what the pool did.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one type, e.g. `"model_loaded"`.
    pub fn events_of(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_filters_by_type() {
        let sink = MemorySink::new();
        sink.record(&AuditEvent::ModelLoaded { model: "a".into(), duration_ms: 5 })
            .await
            .unwrap();
        sink.record(&AuditEvent::ModelFreed { model: "a".into(), memory_cost: 100 })
            .await
            .unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of("model_freed").len(), 1);
        assert!(sink.events_of("model_restarted").is_empty());
    }
}
