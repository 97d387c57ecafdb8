//! Bringup
//!
//! Brings up a set of interdependent services in dependency order and
//! reports, per service, whether it came up.
//!
//! # Overview
//!
//! A launch file declares nodes, the edges between them and a readiness
//! probe per node. The scheduler then:
//! - Launches a node only after each of its dependencies reached the
//!   condition named on the edge
//! - Polls readiness probes (exit code, health command, numeric predicate)
//! - Cancels everything downstream of the first failure
//! - Enforces a global timeout and stops survivors in reverse order
//!
//! # Example Launch File
//!
//! ```yaml
//! version: "1.0"
//!
//! args:
//!   chain:
//!     default: calibnet
//!
//! nodes:
//!   init:
//!     executable: "forest-tool"
//!     args: ["fetch-params", "--keys"]
//!     condition: completed_successfully
//!
//!   forest:
//!     executable: "forest"
//!     args: ["--chain", "$(arg chain)"]
//!     depends_on:
//!       - init: completed_successfully
//!     probe:
//!       type: command
//!       command: ["forest-cli", "sync", "wait"]
//!       retries: 5
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::BringupArgs;
pub use config::{
    resolve_scheduler_config, LaunchFile, LaunchFileError, SettingsOverrides, SubstitutionContext,
    SubstitutionError,
};
pub use runtime::{
    Bringup, BringupError, ConfigError, DependencyCondition, DependencyEdge, DependencyGraph,
    Invoker, LaunchPlan, NodeSelection, NodeState, ProcessInvoker, RunReport, Scheduler,
    SchedulerConfig, ServiceNode,
};
