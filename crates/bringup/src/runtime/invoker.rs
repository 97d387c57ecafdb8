//! Boundary to whatever actually starts processes or containers

use async_trait::async_trait;
use std::collections::HashMap;

use crate::runtime::node::LaunchSpec;

/// Opaque reference to something an [`Invoker`] launched
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub id: u64,
    pub node: String,
    pub pid: Option<u32>,
}

/// Teardown action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to exit (SIGTERM)
    Stop,
    /// Force it (SIGKILL)
    Kill,
}

/// Short-lived command run by probes, e.g. `forest-cli sync wait`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl CheckCommand {
    /// Build from an argv list; `None` when the list is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: HashMap::new(),
        })
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished check command
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CheckOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Launches nodes and reports on them. The scheduler never shells out itself.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Start the node described by `spec`
    async fn launch(&self, node: &str, spec: &LaunchSpec) -> Result<Handle, InvokerError>;

    /// Deliver a teardown signal. Signalling an exited handle is not an error.
    async fn signal(&self, handle: &Handle, signal: StopSignal) -> Result<(), InvokerError>;

    /// Exit code once the process is gone, `None` while it still runs
    async fn exit_code(&self, handle: &Handle) -> Option<i32>;

    /// Run a check command to completion
    async fn exec(&self, check: &CheckCommand) -> Result<CheckOutput, InvokerError>;
}

/// Errors reported by an [`Invoker`]
#[derive(Debug, thiserror::Error)]
pub enum InvokerError {
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown handle {0}")]
    UnknownHandle(u64),

    #[error("Failed to signal '{node}': {message}")]
    SignalFailed { node: String, message: String },

    #[error("Invoker error: {0}")]
    Other(String),
}
