use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::{error, info};
use uuid::Uuid;

use super::{AuditSink, Decision, ExecutionRecord};
use crate::{alert::AlertStatus, executor::Outcome, Error, Result};

/// Audit records in a SQLite table.
pub struct SqliteAuditSink {
    pool: Pool<Sqlite>,
    location: String,
}

impl SqliteAuditSink {
    pub async fn new(path: &Path) -> Result<Self> {
        info!("Connecting to SQLite database: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, path.display().to_string()).await
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options, ":memory:".to_string()).await
    }

    async fn connect(options: SqliteConnectOptions, location: String) -> Result<Self> {
        // a single connection that is never recycled: an in-memory database
        // lives exactly as long as its connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to connect to SQLite: {}", e);
                Error::Sqlx(e)
            })?;
        Ok(Self { pool, location })
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_records (
                id, timestamp, decided_at, alert, resource, remediation_key, alert_status,
                action, decision, outcome, exit_code, duration_ms, output, note
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.timestamp)
        .bind(record.decided_at)
        .bind(&record.alert)
        .bind(&record.resource)
        .bind(&record.remediation_key)
        .bind(record.alert_status.to_string())
        .bind(&record.action)
        .bind(record.decision.as_str())
        .bind(record.outcome.map(|o| o.as_str()))
        .bind(record.exit_code)
        .bind(record.duration_ms.map(|ms| ms as i64))
        .bind(&record.output)
        .bind(&record.note)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, decided_at, alert, resource, remediation_key, alert_status,
                   action, decision, outcome, exit_code, duration_ms, output, note
            FROM execution_records
            ORDER BY rowid DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.location)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ExecutionRecord> {
    let id: String = row.get("id");
    let timestamp: DateTime<Utc> = row.get("timestamp");
    let alert_status: String = row.get("alert_status");
    let decision: String = row.get("decision");
    let outcome: Option<String> = row.get("outcome");
    let duration_ms: Option<i64> = row.get("duration_ms");

    Ok(ExecutionRecord {
        id: Uuid::parse_str(&id).map_err(|e| Error::Audit(format!("Invalid record id: {}", e)))?,
        timestamp,
        decided_at: row.get("decided_at"),
        alert: row.get("alert"),
        resource: row.get("resource"),
        remediation_key: row.get("remediation_key"),
        alert_status: alert_status.parse::<AlertStatus>()?,
        action: row.get("action"),
        decision: decision.parse::<Decision>()?,
        outcome: outcome.as_deref().map(Outcome::from_str).transpose()?,
        exit_code: row.get("exit_code"),
        duration_ms: duration_ms.map(|ms| ms as u64),
        output: row.get("output"),
        note: row.get("note"),
    })
}
