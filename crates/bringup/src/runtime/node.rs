//! Service nodes, readiness conditions and per-node run states

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::probe::ProbeSpec;

/// Condition a node has to reach before a dependent may launch.
///
/// The compose spellings (`service_started`, `service_healthy`,
/// `service_completed_successfully`) are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Process is up and its probe reported ready
    #[serde(alias = "service_started", alias = "service_healthy", alias = "healthy")]
    Started,
    /// Process exited with code 0
    #[serde(alias = "service_completed_successfully")]
    CompletedSuccessfully,
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyCondition::Started => write!(f, "started"),
            DependencyCondition::CompletedSuccessfully => write!(f, "completed_successfully"),
        }
    }
}

/// Fully resolved command line for one node. Opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaunchSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command line as a single string, for logs and the dry-run plan
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }
}

/// One schedulable unit of work
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub id: String,
    pub launch: LaunchSpec,
    pub probe: ProbeSpec,
    /// What this node must reach to count as succeeded
    pub required_condition: DependencyCondition,
    /// Pause between dependencies being satisfied and the launch call
    pub startup_delay: Option<Duration>,
}

impl ServiceNode {
    pub fn new(
        id: impl Into<String>,
        launch: LaunchSpec,
        probe: ProbeSpec,
        required_condition: DependencyCondition,
    ) -> Self {
        Self {
            id: id.into(),
            launch,
            probe,
            required_condition,
            startup_delay: None,
        }
    }

    /// One-shot provisioning task gated on a zero exit code
    pub fn one_shot(id: impl Into<String>, launch: LaunchSpec) -> Self {
        Self::new(
            id,
            launch,
            ProbeSpec::ProcessExit,
            DependencyCondition::CompletedSuccessfully,
        )
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = Some(delay);
        self
    }
}

/// Why a node ended in `Failed`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("launch failed: {0}")]
    Launch(String),

    #[error("process exited with code {0}")]
    ExitCode(i32),

    #[error("process exited with code {0} before becoming ready")]
    ExitedBeforeReady(i32),

    #[error("probe failed after {attempts} consecutive attempts: {last_error}")]
    ProbeExhausted { attempts: u32, last_error: String },

    #[error("probe did not become ready within {0:?}")]
    ProbeTimeout(Duration),

    #[error("source '{0}' exited before the condition held")]
    SourceExited(String),

    #[error("global run deadline elapsed")]
    GlobalTimeout,

    #[error("probe error: {0}")]
    Probe(String),
}

/// Why a node ended in `Cancelled`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelReason {
    #[error("dependency failure in '{0}'")]
    DependencyFailed(String),

    #[error("global run deadline elapsed")]
    GlobalTimeout,

    #[error("run interrupted")]
    Interrupted,
}

/// Lifecycle state of a node during a run
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    NotStarted,
    Launching,
    Running,
    Waiting,
    Succeeded,
    Failed(FailureReason),
    Cancelled(CancelReason),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed(_) | NodeState::Cancelled(_)
        )
    }

    /// Launched but not yet terminal
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            NodeState::Launching | NodeState::Running | NodeState::Waiting
        )
    }

    /// Whether a node in this state satisfies `condition` on an outgoing edge.
    ///
    /// `required` is the node's own required condition. A one-shot node counts
    /// as started as soon as its process is live; a service only once its
    /// probe reported ready.
    pub fn satisfies(&self, condition: DependencyCondition, required: DependencyCondition) -> bool {
        match condition {
            DependencyCondition::CompletedSuccessfully => {
                *self == NodeState::Succeeded
                    && required == DependencyCondition::CompletedSuccessfully
            }
            DependencyCondition::Started => match self {
                NodeState::Succeeded => true,
                NodeState::Running | NodeState::Waiting => {
                    required == DependencyCondition::CompletedSuccessfully
                }
                _ => false,
            },
        }
    }

    /// Short lowercase name used in reports
    pub fn label(&self) -> &'static str {
        match self {
            NodeState::NotStarted => "not_started",
            NodeState::Launching => "launching",
            NodeState::Running => "running",
            NodeState::Waiting => "waiting",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed(_) => "failed",
            NodeState::Cancelled(_) => "cancelled",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            NodeState::Failed(reason) => Some(reason.to_string()),
            NodeState::Cancelled(reason) => Some(reason.to_string()),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{} ({})", self.label(), detail),
            None => write!(f, "{}", self.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_successfully_requires_one_shot_success() {
        let done = NodeState::Succeeded;
        assert!(done.satisfies(
            DependencyCondition::CompletedSuccessfully,
            DependencyCondition::CompletedSuccessfully
        ));
        assert!(!done.satisfies(
            DependencyCondition::CompletedSuccessfully,
            DependencyCondition::Started
        ));
        assert!(!NodeState::Waiting.satisfies(
            DependencyCondition::CompletedSuccessfully,
            DependencyCondition::CompletedSuccessfully
        ));
    }

    #[test]
    fn test_started_for_services_waits_for_ready() {
        assert!(!NodeState::Waiting.satisfies(
            DependencyCondition::Started,
            DependencyCondition::Started
        ));
        assert!(NodeState::Succeeded.satisfies(
            DependencyCondition::Started,
            DependencyCondition::Started
        ));
    }

    #[test]
    fn test_started_for_one_shot_is_live_process() {
        assert!(NodeState::Running.satisfies(
            DependencyCondition::Started,
            DependencyCondition::CompletedSuccessfully
        ));
        assert!(!NodeState::Launching.satisfies(
            DependencyCondition::Started,
            DependencyCondition::CompletedSuccessfully
        ));
    }

    #[test]
    fn test_failed_never_satisfies() {
        let failed = NodeState::Failed(FailureReason::ExitCode(1));
        assert!(!failed.satisfies(
            DependencyCondition::Started,
            DependencyCondition::CompletedSuccessfully
        ));
        assert!(failed.is_terminal());
        assert!(!failed.is_in_flight());
    }

    #[test]
    fn test_condition_compose_aliases() {
        let c: DependencyCondition =
            serde_yaml::from_str("service_completed_successfully").unwrap();
        assert_eq!(c, DependencyCondition::CompletedSuccessfully);
        let c: DependencyCondition = serde_yaml::from_str("service_healthy").unwrap();
        assert_eq!(c, DependencyCondition::Started);
    }

    #[test]
    fn test_state_display() {
        let state = NodeState::Cancelled(CancelReason::DependencyFailed("peer".into()));
        assert_eq!(state.to_string(), "cancelled (dependency failure in 'peer')");
        assert_eq!(NodeState::Succeeded.to_string(), "succeeded");
    }
}
