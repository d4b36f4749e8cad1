//! Userspace matching of decoded exec and connect records against
//! `[[exec]]` and `[[connect]]` rules. These rules only label events; the
//! kernel decision is already made.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use aegis_common::{ConnectEvent, ExecEvent, AF_INET};
use anyhow::{bail, Context};
use ipnetwork::IpNetwork;
use serde::Deserialize;

use crate::policy::RuleState;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    Warning,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

/// `allow` rules whitelist an event: when one matches, no alert is raised.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchAction {
    Allow,
    Alert,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    #[default]
    Contains,
    Prefix,
}

impl MatchType {
    pub fn matches(self, pattern: &str, value: &str) -> bool {
        match self {
            MatchType::Exact => value == pattern,
            MatchType::Contains => value.contains(pattern),
            MatchType::Prefix => value.starts_with(pattern),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    pub action: MatchAction,
    #[serde(default)]
    pub state: RuleState,
    pub process_name: Option<String>,
    #[serde(default)]
    pub process_name_type: MatchType,
    pub parent_name: Option<String>,
    #[serde(default)]
    pub parent_name_type: MatchType,
    pub pid: Option<u32>,
    pub ppid: Option<u32>,
    pub cgroup_id: Option<u64>,
}

impl ExecRule {
    fn has_criteria(&self) -> bool {
        self.process_name.is_some()
            || self.parent_name.is_some()
            || self.pid.is_some()
            || self.ppid.is_some()
            || self.cgroup_id.is_some()
    }

    /// Every criterion the rule sets must hold.
    fn matches(&self, exec: &ExecFacts<'_>) -> bool {
        let name_ok = |pattern: &Option<String>, kind: MatchType, value: &str| {
            pattern.as_deref().map_or(true, |p| kind.matches(p, value))
        };
        name_ok(&self.process_name, self.process_name_type, exec.process)
            && name_ok(&self.parent_name, self.parent_name_type, exec.parent)
            && self.pid.map_or(true, |pid| pid == exec.pid)
            && self.ppid.map_or(true, |ppid| ppid == exec.ppid)
            && self.cgroup_id.map_or(true, |id| id == exec.cgroup_id)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConnectRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    pub action: MatchAction,
    #[serde(default)]
    pub state: RuleState,
    /// A CIDR block or a single address.
    pub dest_ip: Option<String>,
    pub dest_port: Option<u16>,
    pub pid: Option<u32>,
    pub cgroup_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledConnect {
    rule: ConnectRule,
    network: Option<IpNetwork>,
}

impl CompiledConnect {
    fn matches(&self, dest: IpAddr, port: u16, pid: u32, cgroup_id: u64) -> bool {
        self.rule.dest_port.map_or(true, |p| p == port)
            && self.network.map_or(true, |net| net.contains(dest))
            && self.rule.pid.map_or(true, |p| p == pid)
            && self.rule.cgroup_id.map_or(true, |id| id == cgroup_id)
    }
}

/// What an exec record is matched on.
pub struct ExecFacts<'a> {
    /// Basename of the executed file, or the task name when the path is
    /// unknown.
    pub process: &'a str,
    pub parent: &'a str,
    pub pid: u32,
    pub ppid: u32,
    pub cgroup_id: u64,
}

impl<'a> ExecFacts<'a> {
    pub fn from_event(event: &'a ExecEvent) -> Self {
        let filename = text(&event.filename);
        let process = match Path::new(filename).file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => text(&event.header.comm),
        };
        Self {
            process,
            parent: text(&event.pcomm),
            pid: event.header.pid,
            ppid: event.ppid,
            cgroup_id: event.header.cgroup_id,
        }
    }
}

fn text(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// A matched alert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert<'a> {
    pub name: &'a str,
    pub severity: Severity,
    pub description: &'a str,
    /// The rule is still being tried out.
    pub testing: bool,
}

impl fmt::Display for Alert<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.severity)?;
        if self.testing {
            f.write_str(" [testing]")?;
        }
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct RuleEngine {
    exec: Vec<ExecRule>,
    connect: Vec<CompiledConnect>,
}

fn active(state: RuleState) -> bool {
    matches!(state, RuleState::Testing | RuleState::Production)
}

impl RuleEngine {
    pub fn new(exec: &[ExecRule], connect: &[ConnectRule]) -> anyhow::Result<Self> {
        let mut engine = Self::default();
        for rule in exec {
            if !rule.has_criteria() {
                bail!("exec rule `{}` has nothing to match on", rule.name);
            }
            if active(rule.state) {
                engine.exec.push(rule.clone());
            }
        }
        for rule in connect {
            if rule.dest_ip.is_none() && rule.dest_port.is_none() {
                bail!("connect rule `{}` needs dest_ip or dest_port", rule.name);
            }
            let network = match &rule.dest_ip {
                Some(ip) => Some(
                    ip.trim()
                        .parse::<IpNetwork>()
                        .with_context(|| format!("connect rule `{}`: bad dest_ip `{}`", rule.name, ip))?,
                ),
                None => None,
            };
            if active(rule.state) {
                engine.connect.push(CompiledConnect {
                    rule: rule.clone(),
                    network,
                });
            }
        }
        Ok(engine)
    }

    pub fn rule_count(&self) -> usize {
        self.exec.len() + self.connect.len()
    }

    pub fn exec_alerts(&self, event: &ExecEvent) -> Vec<Alert<'_>> {
        self.match_exec(&ExecFacts::from_event(event))
    }

    pub fn match_exec(&self, exec: &ExecFacts<'_>) -> Vec<Alert<'_>> {
        let hits = self.exec.iter().filter(|rule| rule.matches(exec));
        collect(hits.map(|r| (r.action, r.state, r.name.as_str(), r.severity, r.description.as_str())))
    }

    pub fn connect_alerts(&self, event: &ConnectEvent) -> Vec<Alert<'_>> {
        let dest = match event.family {
            AF_INET => IpAddr::V4(Ipv4Addr::from(event.addr_v4)),
            _ => IpAddr::V6(Ipv6Addr::from(event.addr_v6)),
        };
        self.match_connect(dest, event.port, event.header.pid, event.header.cgroup_id)
    }

    pub fn match_connect(&self, dest: IpAddr, port: u16, pid: u32, cgroup_id: u64) -> Vec<Alert<'_>> {
        let hits = self
            .connect
            .iter()
            .filter(|c| c.matches(dest, port, pid, cgroup_id))
            .map(|c| &c.rule);
        collect(hits.map(|r| (r.action, r.state, r.name.as_str(), r.severity, r.description.as_str())))
    }
}

/// A production allow rule among the hits suppresses every alert. Testing
/// allow rules do not.
fn collect<'a>(
    hits: impl Iterator<Item = (MatchAction, RuleState, &'a str, Severity, &'a str)>,
) -> Vec<Alert<'a>> {
    let mut alerts = Vec::new();
    for (action, state, name, severity, description) in hits {
        let testing = state == RuleState::Testing;
        match action {
            MatchAction::Allow if !testing => return Vec::new(),
            MatchAction::Allow => {}
            MatchAction::Alert => alerts.push(Alert {
                name,
                severity,
                description,
                testing,
            }),
        }
    }
    alerts
}
