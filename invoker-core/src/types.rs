//! Core types shared by every invoker component

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Address identifying a fleet member
pub type Host = String;

/// Token in `JobConfig::rest` that carries the restart intent
pub const RESTARTABLE_ARG: &str = "hf_action_restartable";

/// Placeholder host list entry for single-node jobs
pub const LOCALHOST: &str = "localhost";

/// Fleet-wide identifier of a job
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey {
    pub project: String,
    pub experiment: String,
}

impl JobKey {
    pub fn new(project: impl Into<String>, experiment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            experiment: experiment.into(),
        }
    }

    /// Container name used when a job sets no explicit one
    pub fn default_container_name(&self) -> String {
        format!("{}-{}", self.project, self.experiment)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.experiment)
    }
}

impl FromStr for JobKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((project, experiment))
                if !project.is_empty() && !experiment.is_empty() && !experiment.contains('.') =>
            {
                Ok(JobKey::new(project, experiment))
            }
            _ => Err(format!("invalid job key {:?}, expected project.experiment", s)),
        }
    }
}

impl TryFrom<String> for JobKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobKey> for String {
    fn from(key: JobKey) -> Self {
        key.to_string()
    }
}

/// Whether a job is expected to still be running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stoppable,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stoppable => "stoppable",
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(DesiredState::Running),
            "stoppable" => Ok(DesiredState::Stoppable),
            other => Err(format!("unknown desired state {:?}", other)),
        }
    }
}

/// Malformed or missing launch parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("hosts must contain at least one entry")]
    NoHosts,

    #[error("host entry {0} is empty")]
    EmptyHost(usize),

    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        field: &'static str,
        min: i64,
        value: i64,
    },

    #[error("{field} {value:?} is not a valid name")]
    InvalidName { field: &'static str, value: String },

    #[error("master host {0:?} is not an IP address")]
    InvalidMasterHost(String),
}

/// Launch parameters of one job
///
/// Compared structurally across the fleet, so field order of `hosts` and
/// `rest` is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub project_name: String,
    pub hosts: Vec<Host>,
    pub nproc_per_node: u32,
    pub experiment_name: String,
    pub port: u16,
    pub run_name: String,
    pub max_repeats: i64,
    #[serde(default)]
    pub rest: Vec<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub master_host: Option<String>,
    #[serde(default)]
    pub no_python: Option<String>,
}

impl JobConfig {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.project_name, &self.experiment_name)
    }

    /// True when both configs describe the same launch
    pub fn same_launch(&self, other: &JobConfig) -> bool {
        self == other
    }

    /// Desired state encoded in the pass-through arguments
    pub fn desired_state(&self) -> DesiredState {
        let running = self.rest.iter().any(|arg| {
            matches!(arg.split_once('='), Some((RESTARTABLE_ARG, "running")))
        });

        if running {
            DesiredState::Running
        } else {
            DesiredState::Stoppable
        }
    }

    pub fn container_name(&self) -> String {
        match self.container_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.key().default_container_name(),
        }
    }

    /// Explicit master override, else the first host
    pub fn master(&self) -> Option<&str> {
        match self.master_host.as_deref() {
            Some(master) if !master.is_empty() => Some(master),
            _ => self.hosts.first().map(String::as_str),
        }
    }

    /// True for the `["localhost"]` single-node placeholder
    pub fn is_single_node(&self) -> bool {
        self.hosts.len() == 1 && self.hosts[0] == LOCALHOST
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name("project_name", &self.project_name)?;
        validate_name("experiment_name", &self.experiment_name)?;
        validate_name("run_name", &self.run_name)?;

        if self.hosts.is_empty() {
            return Err(ValidationError::NoHosts);
        }
        if let Some(idx) = self.hosts.iter().position(|h| h.trim().is_empty()) {
            return Err(ValidationError::EmptyHost(idx));
        }

        check_min("nproc_per_node", self.nproc_per_node as i64, 1)?;
        check_min("port", self.port as i64, 1)?;
        check_min("max_repeats", self.max_repeats, -1)?;

        if let Some(master) = self.master_host.as_deref() {
            if !master.is_empty() && master.parse::<IpAddr>().is_err() {
                return Err(ValidationError::InvalidMasterHost(master.to_string()));
            }
        }

        Ok(())
    }
}

fn check_min(field: &'static str, value: i64, min: i64) -> Result<(), ValidationError> {
    if value < min {
        return Err(ValidationError::BelowMinimum { field, min, value });
    }
    Ok(())
}

/// Names end up in file and container names: `[A-Za-z_][A-Za-z0-9_-]*`
fn validate_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let mut chars = value.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            field,
            value: value.to_string(),
        })
    }
}

/// One host's observation of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMatch {
    pub expected: DesiredState,
    pub actual: i64,
    pub config: JobConfig,
}

impl StateMatch {
    pub fn needs_restart(&self) -> bool {
        crate::restart::needs_restart(self.expected, self.actual)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn job(project: &str, experiment: &str, hosts: &[&str]) -> JobConfig {
        JobConfig {
            project_name: project.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            nproc_per_node: 8,
            experiment_name: experiment.to_string(),
            port: 1234,
            run_name: "main".to_string(),
            max_repeats: -1,
            rest: vec!["hf_action_restartable=running".to_string()],
            container_name: None,
            master_host: None,
            no_python: None,
        }
    }
}
