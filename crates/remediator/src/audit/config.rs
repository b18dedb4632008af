use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_JSONL_PATH: &str = "/var/log/alerts.log";
pub const DEFAULT_SQLITE_PATH: &str = "data/remediator.db";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(rename = "type")]
    pub sink_type: AuditSinkType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,

    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkType {
    Jsonl,
    Sqlite,
}

impl std::str::FromStr for AuditSinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jsonl" => Ok(AuditSinkType::Jsonl),
            "sqlite" => Ok(AuditSinkType::Sqlite),
            other => Err(format!("unknown audit sink '{}' (expected jsonl or sqlite)", other)),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink_type: AuditSinkType::Jsonl,
            jsonl_path: Some(PathBuf::from(DEFAULT_JSONL_PATH)),
            sqlite_path: Some(PathBuf::from(DEFAULT_SQLITE_PATH)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self.sink_type {
            AuditSinkType::Jsonl => {
                if self.jsonl_path.is_none() {
                    return Err("Audit log path is required for the jsonl sink".to_string());
                }
            }
            AuditSinkType::Sqlite => {
                if self.sqlite_path.is_none() {
                    return Err("SQLite path is required for the sqlite sink".to_string());
                }
            }
        }
        if self.queue_capacity == 0 {
            return Err("Audit queue capacity must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AuditConfig::default();
        assert_eq!(config.sink_type, AuditSinkType::Jsonl);
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_validate_requires_path_for_sink() {
        let config = AuditConfig {
            sink_type: AuditSinkType::Sqlite,
            sqlite_path: None,
            ..AuditConfig::default()
        };
        tokio_test::assert_err!(config.validate());

        let config = AuditConfig {
            queue_capacity: 0,
            ..AuditConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sink_type_from_str() {
        assert_eq!("SQLite".parse::<AuditSinkType>().unwrap(), AuditSinkType::Sqlite);
        assert_eq!("jsonl".parse::<AuditSinkType>().unwrap(), AuditSinkType::Jsonl);
        assert!("postgres".parse::<AuditSinkType>().is_err());
    }
}
