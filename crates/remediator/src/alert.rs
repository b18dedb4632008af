//! Alert notifications as delivered by Alertmanager.
//!
//! The webhook payload is decoded into [`AlertmanagerWebhook`] and then
//! flattened into one [`AlertEvent`] per contained alert.
//!
//! Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Label carrying the alerting rule name.
pub const ALERTNAME_LABEL: &str = "alertname";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Firing => write!(f, "firing"),
            AlertStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for AlertStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "firing" => Ok(AlertStatus::Firing),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(Error::Validation(format!("Unknown alert status: {}", other))),
        }
    }
}

/// Unit of in-flight exclusion and cooldown: alert identifier plus the value
/// of the label that identifies the affected resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RemediationKey {
    pub alert: String,
    pub resource: String,
}

impl RemediationKey {
    pub fn new(alert: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            alert: alert.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for RemediationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.alert, self.resource)
    }
}

/// Alertmanager webhook payload (version 4).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerWebhook {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub group_key: String,
    /// Status of the whole group; used for alerts that carry no status of their own
    pub status: AlertStatus,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub truncated_alerts: u32,
    #[serde(default)]
    pub group_labels: HashMap<String, String>,
    #[serde(default)]
    pub common_labels: HashMap<String, String>,
    #[serde(default)]
    pub common_annotations: HashMap<String, String>,
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    pub alerts: Vec<AlertmanagerAlert>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    #[serde(default)]
    pub status: Option<AlertStatus>,
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub starts_at: DateTime<Utc>,
    /// Absent, empty and the zero time all mean "not ended"
    #[serde(default, deserialize_with = "deserialize_optional_time")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    #[serde(default)]
    pub fingerprint: String,
}

/// One notified alert instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Name of the alerting rule (the `alertname` label)
    pub identifier: String,
    pub status: AlertStatus,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub starts_at: DateTime<Utc>,
    /// Only set for resolved alerts
    pub ends_at: Option<DateTime<Utc>>,
    pub fingerprint: Option<String>,
}

impl AlertEvent {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn is_firing(&self) -> bool {
        self.status == AlertStatus::Firing
    }

    pub fn summary(&self) -> Option<&str> {
        self.annotations.get("summary").map(String::as_str)
    }
}

impl AlertmanagerWebhook {
    /// Parse a raw request body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Flatten the batch into alert events.
    ///
    /// Fails as a whole if any alert lacks an identifier, so that a
    /// malformed batch is never partially processed.
    pub fn into_events(self) -> Result<Vec<AlertEvent>> {
        let batch_status = self.status;
        self.alerts
            .into_iter()
            .enumerate()
            .map(|(index, alert)| alert.into_event(batch_status, index))
            .collect()
    }
}

impl AlertmanagerAlert {
    fn into_event(self, batch_status: AlertStatus, index: usize) -> Result<AlertEvent> {
        let identifier = self
            .labels
            .get(ALERTNAME_LABEL)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "alert #{} is missing the '{}' label",
                    index, ALERTNAME_LABEL
                ))
            })?;

        let status = self.status.unwrap_or(batch_status);
        // Alertmanager sends a projected resolve time for firing alerts
        let ends_at = match status {
            AlertStatus::Resolved => self.ends_at,
            AlertStatus::Firing => None,
        };

        Ok(AlertEvent {
            identifier,
            status,
            labels: self.labels,
            annotations: self.annotations,
            starts_at: self.starts_at,
            ends_at,
            fingerprint: Some(self.fingerprint).filter(|f| !f.is_empty()),
        })
    }
}

fn deserialize_optional_time<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => {
            let parsed = DateTime::parse_from_rfc3339(value)
                .map_err(serde::de::Error::custom)?
                .with_timezone(&Utc);
            if parsed.year() <= 1 {
                Ok(None)
            } else {
                Ok(Some(parsed))
            }
        }
    }
}
