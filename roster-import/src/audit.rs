//! Audit sinks
//!
//! The service hands every outcome to an [`AuditSink`] after the import
//! transaction has closed. Sinks are fire-and-forget: `record` never blocks
//! and never reports failure back, so auditing cannot change what was
//! committed.

use roster_common::db::AuditLogEntry;
use roster_common::{EventBus, RosterEvent};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver of post-commit outcome notifications
pub trait AuditSink: Send + Sync {
    fn record(&self, event: RosterEvent);
}

/// Broadcasts events on the in-process [`EventBus`]
#[derive(Clone)]
pub struct EventBusAuditSink {
    bus: EventBus,
}

impl EventBusAuditSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl AuditSink for EventBusAuditSink {
    fn record(&self, event: RosterEvent) {
        debug!(event_type = event.event_type(), "Broadcasting audit event");
        self.bus.emit_lossy(event);
    }
}

/// Persists events to the `audit_log` table
#[derive(Clone)]
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one audit row
    pub async fn write(&self, event: &RosterEvent) -> Result<(), sqlx::Error> {
        let metadata = serde_json::to_string(event).ok();

        sqlx::query(
            r#"
            INSERT INTO audit_log (log_type, message, metadata, actor_id)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(event.log_type())
        .bind(event.message())
        .bind(metadata)
        .bind(event.actor_id())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent audit rows, newest first
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditLogEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, log_type, message, metadata, actor_id, CAST(logged_at AS TEXT) AS logged_at
            FROM audit_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AuditLogEntry, sqlx::Error> {
                let metadata: Option<String> = row.try_get("metadata")?;
                Ok(AuditLogEntry {
                    id: row.try_get("id")?,
                    log_type: row.try_get("log_type")?,
                    message: row.try_get("message")?,
                    metadata: metadata.and_then(|m| serde_json::from_str::<Value>(&m).ok()),
                    actor_id: row.try_get("actor_id")?,
                    logged_at: row.try_get("logged_at")?,
                })
            })
            .collect()
    }

    /// Drain `rx` into the audit table until every sender is gone
    ///
    /// Lagged events are reported and skipped.
    pub fn spawn_writer(self, mut rx: broadcast::Receiver<RosterEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.write(&event).await {
                            warn!("Failed to write audit event {}: {}", event.event_type(), e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Audit writer lagged, {} events not recorded", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl AuditSink for SqliteAuditLog {
    fn record(&self, event: RosterEvent) {
        let log = self.clone();
        tokio::spawn(async move {
            if let Err(e) = log.write(&event).await {
                warn!("Failed to write audit event {}: {}", event.event_type(), e);
            }
        });
    }
}
