//! Alert Router
//!
//! Picks zero or one remediation action for an alert. Resolved alerts never
//! trigger anything; firing alerts need a registered action and a usable
//! resource label.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    alert::{AlertEvent, RemediationKey},
    registry::{ActionRegistry, RemediationAction},
};

lazy_static! {
    /// Resource values end up in command arguments, so only a conservative
    /// character set is accepted.
    static ref RESOURCE_VALUE: Regex =
        Regex::new(r"^[A-Za-z0-9._:/@-]{1,253}$").expect("resource pattern is valid");
}

pub fn is_valid_resource(value: &str) -> bool {
    RESOURCE_VALUE.is_match(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoActionReason {
    Resolved,
    Unregistered,
    MissingResourceLabel { label: String },
    InvalidResource { label: String, value: String },
}

impl fmt::Display for NoActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoActionReason::Resolved => write!(f, "alert resolved"),
            NoActionReason::Unregistered => write!(f, "no action registered for alert"),
            NoActionReason::MissingResourceLabel { label } => {
                write!(f, "data quality: resource label '{}' missing", label)
            }
            NoActionReason::InvalidResource { label, value } => write!(
                f,
                "data quality: resource label '{}' has unsafe value {:?}",
                label, value
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RouteDecision {
    Dispatch {
        action: Arc<RemediationAction>,
        key: RemediationKey,
    },
    NoAction {
        reason: NoActionReason,
        /// Matched action, if the alert got as far as the registry
        action: Option<Arc<RemediationAction>>,
    },
}

#[derive(Debug, Clone)]
pub struct AlertRouter {
    registry: Arc<ActionRegistry>,
}

impl AlertRouter {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn route(&self, event: &AlertEvent) -> RouteDecision {
        if !event.is_firing() {
            debug!(alert = %event.identifier, "Resolved alert, nothing to do");
            return RouteDecision::NoAction {
                reason: NoActionReason::Resolved,
                action: None,
            };
        }

        let Some(action) = self.registry.lookup(&event.identifier) else {
            debug!(alert = %event.identifier, "No remediation registered");
            return RouteDecision::NoAction {
                reason: NoActionReason::Unregistered,
                action: None,
            };
        };

        let label = action.resource_label.clone();
        let reason = match event.label(&label) {
            None => NoActionReason::MissingResourceLabel { label },
            Some(value) if !is_valid_resource(value) => NoActionReason::InvalidResource {
                label,
                value: value.to_string(),
            },
            Some(value) => {
                return RouteDecision::Dispatch {
                    key: RemediationKey::new(event.identifier.clone(), value),
                    action,
                }
            }
        };

        warn!(alert = %event.identifier, "{}", reason);
        RouteDecision::NoAction {
            reason,
            action: Some(action),
        }
    }
}
