//! Policy file parsing and compilation into map entries.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use aegis_common::policy::encode_path_key;
use aegis_common::{Action, MAX_POLICY_ENTRIES, PATH_MAX_LEN};
use anyhow::{bail, Context};
use log::warn;
use serde::Deserialize;

use crate::rules::{ConnectRule, ExecRule, RuleEngine, Severity};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Monitor,
    Block,
}

impl From<RuleAction> for Action {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Monitor => Action::Monitor,
            RuleAction::Block => Action::Block,
        }
    }
}

/// Lifecycle of a rule. Only testing and production rules are installed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    Draft,
    Testing,
    #[default]
    Production,
    Archived,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathRule {
    pub name: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    pub path: String,
    pub action: RuleAction,
    #[serde(default)]
    pub state: RuleState,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRule {
    pub name: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    pub port: u16,
    pub action: RuleAction,
    #[serde(default)]
    pub state: RuleState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    #[serde(default)]
    pub path: Vec<PathRule>,
    #[serde(default)]
    pub port: Vec<PortRule>,
    #[serde(default)]
    pub exec: Vec<ExecRule>,
    #[serde(default)]
    pub connect: Vec<ConnectRule>,
}

impl PolicyFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("invalid policy file {}", path.display()))
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    pub fn add_path(&mut self, path: &str, action: RuleAction) {
        self.path.push(PathRule {
            name: None,
            severity: Severity::default(),
            path: path.to_string(),
            action,
            state: RuleState::Production,
        });
    }

    pub fn add_port(&mut self, port: u16, action: RuleAction) {
        self.port.push(PortRule {
            name: None,
            severity: Severity::default(),
            port,
            action,
            state: RuleState::Production,
        });
    }

    pub fn compile(&self) -> anyhow::Result<CompiledPolicy> {
        let mut paths = Merger::default();
        for rule in &self.path {
            let key = normalize_path_key(&rule.path)?;
            if !key.contains('/') {
                warn!("basename rule `{}` matches that name in every directory", key);
            }
            let label = RuleLabel::new(rule.name.as_deref(), &key, rule.severity);
            paths.add(key, rule.action, rule.state, label);
        }
        let mut ports = Merger::default();
        for rule in &self.port {
            let label = RuleLabel::new(rule.name.as_deref(), &format!("port {}", rule.port), rule.severity);
            ports.add(rule.port, rule.action, rule.state, label);
        }

        let (paths, path_labels) = paths.finish();
        let (ports, port_labels) = ports.finish();
        let compiled = CompiledPolicy {
            paths,
            ports,
            path_labels,
            port_labels,
            rules: RuleEngine::new(&self.exec, &self.connect)?,
        };
        for (kind, len) in [("path", compiled.paths.len()), ("port", compiled.ports.len())] {
            if len > MAX_POLICY_ENTRIES as usize {
                bail!("{} {} rules exceed the map capacity of {}", len, kind, MAX_POLICY_ENTRIES);
            }
        }
        Ok(compiled)
    }
}

/// Name and severity of the rule that decided a map entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLabel {
    pub name: String,
    pub severity: Severity,
}

impl RuleLabel {
    fn new(name: Option<&str>, key: &str, severity: Severity) -> Self {
        Self {
            name: name.unwrap_or(key).to_string(),
            severity,
        }
    }
}

impl fmt::Display for RuleLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.severity)
    }
}

/// Map contents, keyed the way the kernel looks them up, plus what the
/// consumer needs to label events.
#[derive(Debug, Default, PartialEq)]
pub struct CompiledPolicy {
    pub paths: BTreeMap<String, Action>,
    pub ports: BTreeMap<u16, Action>,
    pub path_labels: BTreeMap<String, RuleLabel>,
    pub port_labels: BTreeMap<u16, RuleLabel>,
    pub rules: RuleEngine,
}

impl CompiledPolicy {
    pub fn count(&self, action: Action) -> usize {
        self.paths.values().chain(self.ports.values()).filter(|a| **a == action).count()
    }

    /// The path rule the kernel matched for `path`, probed in the kernel's
    /// order: exact, enclosing directories nearest first, basename.
    pub fn path_label(&self, path: &str) -> Option<&RuleLabel> {
        if path.is_empty() {
            return None;
        }
        if let Some(label) = self.path_labels.get(path) {
            return Some(label);
        }
        let dirs = path
            .rmatch_indices('/')
            .map(|(i, _)| &path[..=i])
            .filter(|dir| dir.len() < path.len());
        for dir in dirs {
            if let Some(label) = self.path_labels.get(dir) {
                return Some(label);
            }
        }
        let base = path.rsplit('/').next().unwrap_or(path);
        match base.is_empty() {
            true => None,
            false => self.path_labels.get(base),
        }
    }

    pub fn port_label(&self, port: u16) -> Option<&RuleLabel> {
        self.port_labels.get(&port)
    }
}

struct Merged {
    action: Action,
    testing: bool,
    label: RuleLabel,
}

/// Folds rules sharing a key. A testing rule pins the key to monitor; among
/// production rules block outranks monitor. The label follows the rule that
/// set the action.
struct Merger<K> {
    entries: BTreeMap<K, Merged>,
}

impl<K> Default for Merger<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Merger<K> {
    fn add(&mut self, key: K, action: RuleAction, state: RuleState, label: RuleLabel) {
        let (action, testing) = match state {
            RuleState::Draft | RuleState::Archived => return,
            RuleState::Testing => (Action::Monitor, true),
            RuleState::Production => (Action::from(action), false),
        };
        let merged = Merged {
            action,
            testing,
            label,
        };
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(merged);
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                match (entry.testing, testing) {
                    (true, _) => {}
                    (false, true) => *entry = merged,
                    (false, false) if action > entry.action => *entry = merged,
                    (false, false) => {}
                }
            }
        }
    }

    fn finish(self) -> (BTreeMap<K, Action>, BTreeMap<K, RuleLabel>) {
        let mut actions = BTreeMap::new();
        let mut labels = BTreeMap::new();
        for (key, merged) in self.entries {
            actions.insert(key.clone(), merged.action);
            labels.insert(key, merged.label);
        }
        (actions, labels)
    }
}

/// `/dir/*` is accepted as a spelling of the `/dir/` prefix key.
pub fn normalize_path_key(raw: &str) -> anyhow::Result<String> {
    let key = raw.trim();
    let key = key.strip_suffix("/*").map_or(key.to_string(), |dir| format!("{}/", dir));
    if encode_path_key(key.as_bytes()).is_none() {
        bail!(
            "path rule `{}` must be non-empty, NUL-free and shorter than {} bytes",
            raw,
            PATH_MAX_LEN
        );
    }
    Ok(key)
}
