//! Action Registry
//!
//! Static mapping from alert identifier to remediation action. Built once at
//! startup and read-only afterwards; every configuration problem is reported
//! here so that nothing about the registry can fail at request time.

mod config;

pub use config::{
    parse_duration, ActionDefaults, ActionSpec, RegistryFile, DEFAULT_COOLDOWN,
    DEFAULT_RESOURCE_LABEL, DEFAULT_TIMEOUT,
};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::{
    alert::RemediationKey,
    executor::{Action, CommandAction},
    template::{ArgTemplates, TemplateVars},
    Error, Result,
};

/// Descriptor of one remediation action. Immutable once registered.
#[derive(Clone)]
pub struct RemediationAction {
    pub match_identifier: String,
    pub timeout: Duration,
    pub cooldown: Duration,
    /// Label whose value identifies the affected resource
    pub resource_label: String,
    args: ArgTemplates,
    raw_args: Vec<String>,
    action: Arc<dyn Action>,
}

impl RemediationAction {
    pub fn new(match_identifier: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            match_identifier: match_identifier.into(),
            timeout: DEFAULT_TIMEOUT,
            cooldown: DEFAULT_COOLDOWN,
            resource_label: DEFAULT_RESOURCE_LABEL.to_string(),
            args: ArgTemplates::default(),
            raw_args: Vec::new(),
            action,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_resource_label(mut self, label: impl Into<String>) -> Self {
        self.resource_label = label.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Result<Self> {
        self.args = ArgTemplates::compile(&args)?;
        self.raw_args = args;
        Ok(self)
    }

    pub fn action(&self) -> &dyn Action {
        self.action.as_ref()
    }

    pub fn describe(&self) -> String {
        self.action.describe()
    }

    pub fn raw_args(&self) -> &[String] {
        &self.raw_args
    }

    /// Resolve the argument templates for a validated remediation key.
    pub fn render_args(&self, key: &RemediationKey) -> Result<Vec<String>> {
        self.args.render(&TemplateVars {
            alert: &key.alert,
            resource: &key.resource,
        })
    }
}

impl fmt::Debug for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemediationAction")
            .field("match_identifier", &self.match_identifier)
            .field("action", &self.action.describe())
            .field("args", &self.raw_args)
            .field("timeout", &self.timeout)
            .field("cooldown", &self.cooldown)
            .field("resource_label", &self.resource_label)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<RemediationAction>>,
}

impl ActionRegistry {
    /// Build a registry, rejecting duplicate identifiers.
    pub fn new(actions: Vec<RemediationAction>) -> Result<Self> {
        let mut registry = HashMap::with_capacity(actions.len());
        for action in actions {
            validate_action(&action)?;
            let identifier = action.match_identifier.clone();
            if registry.insert(identifier.clone(), Arc::new(action)).is_some() {
                return Err(Error::Registry(format!(
                    "Duplicate action for alert '{}'",
                    identifier
                )));
            }
        }
        Ok(Self { actions: registry })
    }

    pub fn from_file(path: &Path, output_limit: usize) -> Result<Self> {
        let file = RegistryFile::load(path)?;
        let registry = Self::from_config(file, output_limit)?;
        info!(
            "Loaded {} remediation actions from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    pub fn from_config(file: RegistryFile, output_limit: usize) -> Result<Self> {
        let defaults = file.defaults;
        let actions = file
            .actions
            .into_iter()
            .map(|spec| build_action(spec, &defaults, output_limit))
            .collect::<Result<Vec<_>>>()?;
        Self::new(actions)
    }

    pub fn lookup(&self, identifier: &str) -> Option<Arc<RemediationAction>> {
        self.actions.get(identifier).cloned()
    }

    /// Registered actions ordered by alert identifier.
    pub fn actions(&self) -> Vec<Arc<RemediationAction>> {
        let mut actions: Vec<_> = self.actions.values().cloned().collect();
        actions.sort_by(|a, b| a.match_identifier.cmp(&b.match_identifier));
        actions
    }

    /// Longest timeout of any registered action, zero when empty.
    pub fn max_timeout(&self) -> Duration {
        self.actions
            .values()
            .map(|action| action.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

fn build_action(
    spec: ActionSpec,
    defaults: &ActionDefaults,
    output_limit: usize,
) -> Result<RemediationAction> {
    let context = |e: Error| Error::Registry(format!("action for '{}': {}", spec.alert, e));

    let command = spec.command.trim();
    if command.is_empty() {
        return Err(Error::Registry(format!(
            "action for '{}' has an empty command",
            spec.alert
        )));
    }
    resolve_command(command).map_err(context)?;

    let resource_label = spec
        .resource_label
        .clone()
        .or_else(|| defaults.resource_label.clone())
        .unwrap_or_else(|| DEFAULT_RESOURCE_LABEL.to_string());

    let executable = CommandAction::new(command).with_output_limit(output_limit);
    RemediationAction::new(spec.alert.trim(), Arc::new(executable))
        .with_timeout(spec.timeout.or(defaults.timeout).unwrap_or(DEFAULT_TIMEOUT))
        .with_cooldown(spec.cooldown.or(defaults.cooldown).unwrap_or(DEFAULT_COOLDOWN))
        .with_resource_label(resource_label)
        .with_args(spec.args.clone())
        .map_err(context)
}

fn validate_action(action: &RemediationAction) -> Result<()> {
    if action.match_identifier.trim().is_empty() {
        return Err(Error::Registry("action with an empty alert identifier".into()));
    }
    if action.timeout.is_zero() {
        return Err(Error::Registry(format!(
            "action for '{}' has a zero timeout",
            action.match_identifier
        )));
    }
    if action.resource_label.trim().is_empty() {
        return Err(Error::Registry(format!(
            "action for '{}' has an empty resource label",
            action.match_identifier
        )));
    }
    Ok(())
}

/// Check that a command exists: paths must point at a file, bare names must
/// be found on `PATH`.
pub fn resolve_command(command: &str) -> Result<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(Error::Registry(format!("command not found: {}", command)))
        };
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(command))
                .find(|candidate| candidate.is_file())
        })
        .ok_or_else(|| Error::Registry(format!("command not found on PATH: {}", command)))
}
