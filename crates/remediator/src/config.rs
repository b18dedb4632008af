use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::audit::{config as audit_defaults, AuditConfig, AuditSinkType};
use crate::executor::DEFAULT_OUTPUT_LIMIT;
use crate::{Error, Result};

pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:5001";
pub const DEFAULT_REGISTRY_PATH: &str = "config/remediations.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub path: PathBuf,
    /// Captured output bound for every action, in bytes
    pub output_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: DEFAULT_SERVER_ADDR.to_string(),
            },
            registry: RegistryConfig {
                path: PathBuf::from(DEFAULT_REGISTRY_PATH),
                output_limit: DEFAULT_OUTPUT_LIMIT,
            },
            audit: AuditConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let config = Config {
            server: ServerConfig {
                addr: var("SERVER_ADDR", DEFAULT_SERVER_ADDR),
            },
            registry: RegistryConfig {
                path: PathBuf::from(var("REGISTRY_PATH", DEFAULT_REGISTRY_PATH)),
                output_limit: parse_number(&lookup, "OUTPUT_LIMIT_BYTES", DEFAULT_OUTPUT_LIMIT)?,
            },
            audit: AuditConfig {
                sink_type: var("AUDIT_SINK", "jsonl")
                    .parse::<AuditSinkType>()
                    .map_err(|e| Error::Config(format!("AUDIT_SINK: {}", e)))?,
                jsonl_path: Some(PathBuf::from(var(
                    "AUDIT_LOG_PATH",
                    audit_defaults::DEFAULT_JSONL_PATH,
                ))),
                sqlite_path: Some(PathBuf::from(var(
                    "AUDIT_SQLITE_PATH",
                    audit_defaults::DEFAULT_SQLITE_PATH,
                ))),
                queue_capacity: parse_number(
                    &lookup,
                    "AUDIT_QUEUE_CAPACITY",
                    audit_defaults::DEFAULT_QUEUE_CAPACITY,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(Error::Config("SERVER_ADDR must not be empty".into()));
        }
        if self.registry.output_limit == 0 {
            return Err(Error::Config(
                "OUTPUT_LIMIT_BYTES must be greater than zero".into(),
            ));
        }
        self.audit.validate().map_err(Error::Config)
    }
}

fn parse_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}: invalid value '{}': {}", name, raw, e))),
    }
}
