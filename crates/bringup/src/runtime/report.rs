//! Final outcome of a run

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::runtime::node::NodeState;

/// Outcome of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    #[serde(serialize_with = "serialize_state")]
    pub state: NodeState,
    /// Failure or cancellation reason
    pub detail: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Time from launch to terminal state; zero for nodes never launched
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
}

fn serialize_state<S: serde::Serializer>(state: &NodeState, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(state.label())
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Per-node outcomes in topological order. Built once at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    /// `success` holds only when every node succeeded
    pub fn new(started_at: DateTime<Utc>, nodes: Vec<NodeReport>) -> Self {
        let success = nodes.iter().all(|n| n.state == NodeState::Succeeded);
        Self {
            success,
            started_at,
            finished_at: Utc::now(),
            nodes,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node == id)
    }

    pub fn state_of(&self, id: &str) -> Option<&NodeState> {
        self.node(id).map(|n| &n.state)
    }

    /// Process exit code for the run
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run Report")?;
        writeln!(f, "==========")?;

        let width = self.nodes.iter().map(|n| n.node.len()).max().unwrap_or(4);
        for node in &self.nodes {
            write!(
                f,
                "  {:<width$}  {:<11} {:>8.1}s",
                node.node,
                node.state.label(),
                node.duration.as_secs_f64(),
                width = width
            )?;
            if let Some(detail) = &node.detail {
                write!(f, "  {}", detail)?;
            }
            writeln!(f)?;
        }

        writeln!(f)?;
        write!(
            f,
            "Result: {}",
            if self.success { "SUCCESS" } else { "FAILURE" }
        )
    }
}
