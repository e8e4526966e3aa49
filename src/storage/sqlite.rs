//! SQLite audit sink

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions},
    Row,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{AuditEvent, AuditSink};

/// One persisted audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: String,
    pub event_type: String,
    pub model: Option<String>,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

/// SQLite-backed audit sink
pub struct SqliteAuditSink {
    pool: SqlitePool,
}

impl SqliteAuditSink {
    pub async fn new(db_path: &str) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("Failed to connect to SQLite audit database")?;

        let sink = Self { pool };
        sink.initialize().await?;

        Ok(sink)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                model TEXT,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_audit_events_created_at ON audit_events(created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite audit sink initialized");
        Ok(())
    }

    /// Most recent events first, optionally restricted to one event type.
    pub async fn recent(&self, limit: i64, event_type: Option<&str>) -> Result<Vec<AuditRecord>> {
        let rows = if let Some(t) = event_type {
            sqlx::query(
                r#"
                SELECT id, event_type, model, payload, created_at
                FROM audit_events
                WHERE event_type = ?
                ORDER BY created_at DESC
                LIMIT ?
                "#,
            )
            .bind(t)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT id, event_type, model, payload, created_at
                FROM audit_events
                ORDER BY created_at DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                Ok(AuditRecord {
                    id: row.get("id"),
                    event_type: row.get("event_type"),
                    model: row.get("model"),
                    payload: serde_json::from_str(&payload)
                        .context("Corrupt audit payload")?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM audit_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("count"))
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(event)?;
        let created_at = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO audit_events (id, event_type, model, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(event.event_type())
        .bind(event.model())
        .bind(&payload)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved audit event {} ({})", id, event.event_type());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReloadReason;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_audit_sink() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("audit.db");
        let sink = SqliteAuditSink::new(db_path.to_str().unwrap()).await.unwrap();

        sink.record(&AuditEvent::ModelLoaded {
            model: "face_detector".to_string(),
            duration_ms: 420,
        })
        .await
        .unwrap();
        sink.record(&AuditEvent::ModelRestarted {
            model: "face_detector".to_string(),
            reason: ReloadReason::Crash,
        })
        .await
        .unwrap();

        assert_eq!(sink.count().await.unwrap(), 2);

        let restarts = sink.recent(10, Some("model_restarted")).await.unwrap();
        assert_eq!(restarts.len(), 1);
        assert_eq!(restarts[0].model.as_deref(), Some("face_detector"));
        assert_eq!(restarts[0].payload["reason"], "crash");

        let all = sink.recent(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
