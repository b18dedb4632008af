use std::sync::Arc;

use super::{AuditConfig, AuditSink, AuditSinkType, JsonlAuditSink, SqliteAuditSink};
use crate::{Error, Result};

pub async fn create_sink(config: &AuditConfig) -> Result<Arc<dyn AuditSink>> {
    config.validate().map_err(Error::Config)?;

    match config.sink_type {
        AuditSinkType::Jsonl => {
            let path = config
                .jsonl_path
                .as_ref()
                .ok_or_else(|| Error::Config("Audit log path not configured".into()))?;
            Ok(Arc::new(JsonlAuditSink::new(path.clone())))
        }
        AuditSinkType::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .ok_or_else(|| Error::Config("SQLite path not configured".into()))?;
            Ok(Arc::new(SqliteAuditSink::new(path).await?))
        }
    }
}
