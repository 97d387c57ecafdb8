//! Launch file YAML schema

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::runtime::{Comparison, DependencyCondition};

/// Root launch file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchFile {
    /// Launch file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Argument definitions with defaults
    #[serde(default)]
    pub args: IndexMap<String, ArgDefinition>,

    /// Environment variables applied to every node and check command
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Run-level limits
    #[serde(default)]
    pub settings: RunSettings,

    /// Node definitions in declaration order
    pub nodes: IndexMap<String, NodeConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Argument definition with default value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDefinition {
    pub default: ArgValue,
    #[serde(default)]
    pub description: Option<String>,
}

/// Argument values can be strings, booleans, or numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    pub fn as_str(&self) -> String {
        match self {
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(f) => f.to_string(),
            ArgValue::String(s) => s.clone(),
        }
    }
}

/// Truthiness of a resolved `enabled` string
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty()
        && !value.eq_ignore_ascii_case("false")
        && !value.eq_ignore_ascii_case("no")
        && !value.eq_ignore_ascii_case("off")
        && value != "0"
}

/// Run-level limits; unset fields fall back to environment, then defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default)]
    pub global_timeout_secs: Option<u64>,
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Executable path or name looked up in PATH
    pub executable: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables specific to this node
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Nodes that must reach a condition first
    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,

    /// What this node has to reach to count as succeeded
    #[serde(default = "default_condition")]
    pub condition: DependencyCondition,

    /// Readiness probe; one-shot nodes default to the exit code
    #[serde(default)]
    pub probe: Option<ProbeConfig>,

    /// Boolean or a substitution string like "$(arg with_f3)"
    #[serde(default = "default_enabled")]
    pub enabled: EnabledValue,

    /// Delay in milliseconds after dependencies are satisfied
    #[serde(default)]
    pub startup_delay_ms: Option<u64>,
}

fn default_condition() -> DependencyCondition {
    DependencyCondition::Started
}

fn default_enabled() -> EnabledValue {
    EnabledValue::Bool(true)
}

/// Enabled value can be a direct boolean or a substitution string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnabledValue {
    Bool(bool),
    String(String),
}

/// Dependency specification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// Just the node name; waits for `started`
    Simple(String),
    /// `{ node_name: condition }`
    Conditional(IndexMap<String, DependencyCondition>),
    /// Compose style `{ node_name: { condition: ... } }`
    Compose(IndexMap<String, ComposeCondition>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeCondition {
    pub condition: DependencyCondition,
}

impl DependencySpec {
    /// `(node, condition)` pairs named by this entry
    pub fn entries(&self) -> Vec<(String, DependencyCondition)> {
        match self {
            DependencySpec::Simple(name) => vec![(name.clone(), DependencyCondition::Started)],
            DependencySpec::Conditional(map) => {
                map.iter().map(|(name, c)| (name.clone(), *c)).collect()
            }
            DependencySpec::Compose(map) => map
                .iter()
                .map(|(name, c)| (name.clone(), c.condition))
                .collect(),
        }
    }
}

fn default_interval_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_predicate_interval_secs() -> u64 {
    5
}

fn default_predicate_timeout_secs() -> u64 {
    300
}

/// Probe section of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    /// Ready when the process exits 0
    ProcessExit,

    /// Health check command with a retry budget
    Command {
        command: Vec<String>,
        #[serde(default = "default_interval_secs")]
        interval_secs: u64,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        #[serde(default = "default_retries")]
        retries: u32,
        #[serde(default)]
        start_period_secs: u64,
    },

    /// Numeric value printed by `query` compared against `threshold`
    Predicate {
        #[serde(default)]
        source: Option<String>,
        query: Vec<String>,
        op: Comparison,
        threshold: f64,
        #[serde(default = "default_predicate_interval_secs")]
        interval_secs: u64,
        #[serde(default = "default_predicate_timeout_secs")]
        timeout_secs: u64,
    },
}

impl LaunchFile {
    /// Load launch file from a YAML file
    pub fn from_file(path: &str) -> Result<Self, LaunchFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| LaunchFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse launch file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, LaunchFileError> {
        let launch_file: LaunchFile = serde_yaml::from_str(content)?;
        launch_file.validate()?;
        Ok(launch_file)
    }

    /// Structural checks that need no substitution
    pub fn validate(&self) -> Result<(), LaunchFileError> {
        for (name, node) in &self.nodes {
            if node.executable.trim().is_empty() {
                return Err(LaunchFileError::Validation(format!(
                    "Node '{}': 'executable' must not be empty",
                    name
                )));
            }

            for dep in &node.depends_on {
                for (dep_name, _) in dep.entries() {
                    if !self.nodes.contains_key(&dep_name) {
                        return Err(LaunchFileError::Validation(format!(
                            "Node '{}': depends on unknown node '{}'",
                            name, dep_name
                        )));
                    }
                }
            }

            match &node.probe {
                None if node.condition == DependencyCondition::Started => {
                    return Err(LaunchFileError::Validation(format!(
                        "Node '{}': a 'started' node needs a probe",
                        name
                    )));
                }
                Some(ProbeConfig::Command {
                    command, retries, ..
                }) => {
                    if command.is_empty() {
                        return Err(LaunchFileError::Validation(format!(
                            "Node '{}': probe command must not be empty",
                            name
                        )));
                    }
                    if *retries == 0 {
                        return Err(LaunchFileError::Validation(format!(
                            "Node '{}': probe retries must be at least 1",
                            name
                        )));
                    }
                }
                Some(ProbeConfig::Predicate { query, .. }) if query.is_empty() => {
                    return Err(LaunchFileError::Validation(format!(
                        "Node '{}': predicate query must not be empty",
                        name
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Errors that can occur when loading a launch file
#[derive(Debug, thiserror::Error)]
pub enum LaunchFileError {
    #[error("Failed to read launch file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse launch file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
