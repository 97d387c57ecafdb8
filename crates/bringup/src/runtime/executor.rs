//! Turns a launch file into a validated graph and runs it

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{
    is_truthy, EnabledValue, LaunchFile, NodeConfig, ProbeConfig, SubstitutionContext,
    SubstitutionError,
};
use crate::runtime::graph::{ConfigError, DependencyEdge, DependencyGraph};
use crate::runtime::invoker::{CheckCommand, Invoker};
use crate::runtime::node::{DependencyCondition, LaunchSpec, ServiceNode};
use crate::runtime::probe::{PollingCommandSpec, PredicateSpec, ProbeSpec};
use crate::runtime::report::RunReport;
use crate::runtime::scheduler::{Scheduler, SchedulerConfig};

/// Explicit node selection from the command line
#[derive(Debug, Clone, Default)]
pub struct NodeSelection {
    /// Enabled regardless of their `enabled` field
    pub enable: HashSet<String>,
    /// Disabled regardless of their `enabled` field
    pub disable: HashSet<String>,
}

/// A launch file bound to its resolved arguments
pub struct Bringup {
    launch_file: LaunchFile,
    subst_ctx: SubstitutionContext,
    selection: NodeSelection,
}

/// Launch plan for dry-run mode
#[derive(Debug)]
pub struct LaunchPlan {
    /// Nodes in launch order
    pub nodes: Vec<LaunchPlanNode>,
    /// Resolved arguments
    pub args: HashMap<String, String>,
    pub scheduler: SchedulerConfig,
}

/// A node in the launch plan
#[derive(Debug)]
pub struct LaunchPlanNode {
    pub name: String,
    pub command: String,
    pub condition: DependencyCondition,
    pub probe: String,
    pub dependencies: Vec<(String, DependencyCondition)>,
    /// Nodes waiting directly on this one
    pub required_by: Vec<String>,
    pub startup_delay: Option<Duration>,
    pub env: HashMap<String, String>,
}

impl Bringup {
    /// Bind a launch file to argument overrides (`key:=value` from the CLI)
    pub fn new(
        launch_file: LaunchFile,
        arg_overrides: HashMap<String, String>,
        selection: NodeSelection,
    ) -> Result<Self, BringupError> {
        let mut args: HashMap<String, String> = launch_file
            .args
            .iter()
            .map(|(name, def)| (name.clone(), def.default.as_str()))
            .collect();

        for (name, value) in arg_overrides {
            if !launch_file.args.contains_key(&name) {
                return Err(BringupError::UnknownArgument(name));
            }
            args.insert(name, value);
        }

        let subst_ctx = SubstitutionContext::new()
            .with_args(args)
            .with_envs(launch_file.env.clone());

        Ok(Self {
            launch_file,
            subst_ctx,
            selection,
        })
    }

    pub fn launch_file(&self) -> &LaunchFile {
        &self.launch_file
    }

    fn substitute(
        &self,
        input: &str,
        context: impl FnOnce() -> String,
    ) -> Result<String, BringupError> {
        self.subst_ctx
            .substitute(input)
            .map_err(|source| BringupError::SubstitutionFailed {
                context: context(),
                source,
            })
    }

    fn substitute_all(
        &self,
        inputs: &[String],
        context: impl FnOnce() -> String,
    ) -> Result<Vec<String>, BringupError> {
        self.subst_ctx
            .substitute_all(inputs)
            .map_err(|source| BringupError::SubstitutionFailed {
                context: context(),
                source,
            })
    }

    /// Names of nodes that take part in this run
    fn resolve_enabled_nodes(&self) -> Result<HashSet<String>, BringupError> {
        let mut enabled = HashSet::new();

        for (name, node) in &self.launch_file.nodes {
            if self.selection.disable.contains(name) {
                continue;
            }
            if self.selection.enable.contains(name) {
                enabled.insert(name.clone());
                continue;
            }

            let is_enabled = match &node.enabled {
                EnabledValue::Bool(b) => *b,
                EnabledValue::String(s) => {
                    is_truthy(&self.substitute(s, || format!("node '{}' enabled", name))?)
                }
            };
            if is_enabled {
                enabled.insert(name.clone());
            } else {
                log::info!("[{}] Disabled", name);
            }
        }

        Ok(enabled)
    }

    /// Resolve global and node environment; node values win
    fn resolve_env(
        &self,
        name: &str,
        node: &NodeConfig,
    ) -> Result<HashMap<String, String>, BringupError> {
        let mut env = HashMap::new();
        for (key, value) in &self.launch_file.env {
            let resolved = self.substitute(value, || format!("global env '{}'", key))?;
            env.insert(key.clone(), resolved);
        }
        for (key, value) in &node.env {
            let resolved = self.substitute(value, || format!("node '{}' env '{}'", name, key))?;
            env.insert(key.clone(), resolved);
        }
        Ok(env)
    }

    fn check_command(
        &self,
        name: &str,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<CheckCommand, BringupError> {
        let argv = self.substitute_all(argv, || format!("node '{}' probe", name))?;
        CheckCommand::from_argv(&argv)
            .map(|check| check.with_env(env.clone()))
            .ok_or_else(|| {
                BringupError::InvalidNodeConfig(format!("Node '{}' has an empty probe command", name))
            })
    }

    fn resolve_probe(
        &self,
        name: &str,
        node: &NodeConfig,
        env: &HashMap<String, String>,
    ) -> Result<ProbeSpec, BringupError> {
        let probe = match &node.probe {
            None | Some(ProbeConfig::ProcessExit) => ProbeSpec::ProcessExit,
            Some(ProbeConfig::Command {
                command,
                interval_secs,
                timeout_secs,
                retries,
                start_period_secs,
            }) => ProbeSpec::PollingCommand(PollingCommandSpec {
                check: self.check_command(name, command, env)?,
                interval: Duration::from_secs(*interval_secs),
                timeout: Duration::from_secs(*timeout_secs),
                retries: *retries,
                start_period: Duration::from_secs(*start_period_secs),
            }),
            Some(ProbeConfig::Predicate {
                source,
                query,
                op,
                threshold,
                interval_secs,
                timeout_secs,
            }) => ProbeSpec::ConditionPredicate(PredicateSpec {
                source: source.clone(),
                query: self.check_command(name, query, env)?,
                comparison: *op,
                threshold: *threshold,
                interval: Duration::from_secs(*interval_secs),
                timeout: Duration::from_secs(*timeout_secs),
            }),
        };
        Ok(probe)
    }

    fn resolve_node(&self, name: &str, node: &NodeConfig) -> Result<ServiceNode, BringupError> {
        let executable = self.substitute(&node.executable, || {
            format!("node '{}' executable", name)
        })?;
        let args = self.substitute_all(&node.args, || format!("node '{}' args", name))?;
        let env = self.resolve_env(name, node)?;
        let working_dir = match &node.working_dir {
            Some(dir) => Some(PathBuf::from(
                self.substitute(dir, || format!("node '{}' working_dir", name))?,
            )),
            None => None,
        };
        let probe = self.resolve_probe(name, node, &env)?;

        let launch = LaunchSpec {
            executable,
            args,
            env,
            working_dir,
        };
        let mut resolved = ServiceNode::new(name, launch, probe, node.condition);
        if let Some(delay) = node.startup_delay_ms {
            resolved = resolved.with_startup_delay(Duration::from_millis(delay));
        }
        Ok(resolved)
    }

    /// Resolve every enabled node and validate the resulting graph
    pub fn graph(&self) -> Result<DependencyGraph, BringupError> {
        let enabled = self.resolve_enabled_nodes()?;
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        for (name, node) in &self.launch_file.nodes {
            if !enabled.contains(name) {
                continue;
            }
            nodes.push(self.resolve_node(name, node)?);

            for dep in &node.depends_on {
                for (dep_name, condition) in dep.entries() {
                    if !enabled.contains(&dep_name) {
                        return Err(ConfigError::DisabledDependency {
                            node: name.clone(),
                            dependency: dep_name,
                        }
                        .into());
                    }
                    edges.push(DependencyEdge::new(dep_name, name.clone(), condition));
                }
            }
        }

        Ok(DependencyGraph::build(nodes, edges)?)
    }

    /// Generate a launch plan (for dry-run mode)
    pub fn plan(&self, scheduler: SchedulerConfig) -> Result<LaunchPlan, BringupError> {
        let graph = self.graph()?;
        let nodes = graph
            .nodes()
            .map(|node| LaunchPlanNode {
                name: node.id.clone(),
                command: node.launch.command_line(),
                condition: node.required_condition,
                probe: node.probe.describe(),
                dependencies: graph
                    .dependencies(&node.id)
                    .iter()
                    .map(|edge| (edge.from.clone(), edge.condition))
                    .collect(),
                required_by: graph.dependents(&node.id).to_vec(),
                startup_delay: node.startup_delay,
                env: node.launch.env.clone(),
            })
            .collect();

        Ok(LaunchPlan {
            nodes,
            args: self.subst_ctx.args.clone(),
            scheduler,
        })
    }

    /// Build the graph and run it to completion
    pub async fn run(
        &self,
        invoker: Arc<dyn Invoker>,
        config: SchedulerConfig,
        interrupt: watch::Receiver<()>,
    ) -> Result<RunReport, BringupError> {
        let graph = self.graph()?;
        let scheduler = Scheduler::new(invoker, config);
        Ok(scheduler.run(&graph, interrupt).await)
    }
}

/// Errors raised before a run starts
#[derive(Debug, thiserror::Error)]
pub enum BringupError {
    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Substitution failed in {context}: {source}")]
    SubstitutionFailed {
        context: String,
        #[source]
        source: SubstitutionError,
    },

    #[error("Invalid node configuration: {0}")]
    InvalidNodeConfig(String),
}

/// Display the launch plan in a human-readable format
impl std::fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;
        writeln!(
            f,
            "Global timeout: {:?}, grace period: {:?}",
            self.scheduler.global_timeout, self.scheduler.grace_period
        )?;

        if !self.args.is_empty() {
            writeln!(f)?;
            writeln!(f, "Arguments:")?;
            let mut args: Vec<_> = self.args.iter().collect();
            args.sort();
            for (key, value) in args {
                writeln!(f, "  {}: {}", key, value)?;
            }
        }

        writeln!(f)?;
        write!(f, "Nodes (in launch order):")?;
        for (i, node) in self.nodes.iter().enumerate() {
            writeln!(f)?;
            writeln!(f)?;
            writeln!(f, "  {}. {} [{}]", i + 1, node.name, node.condition)?;
            writeln!(f, "     Command: {}", node.command)?;
            write!(f, "     Probe: {}", node.probe)?;

            if !node.dependencies.is_empty() {
                let deps: Vec<String> = node
                    .dependencies
                    .iter()
                    .map(|(name, condition)| format!("{} ({})", name, condition))
                    .collect();
                writeln!(f)?;
                write!(f, "     Depends on: {}", deps.join(", "))?;
            }

            if !node.required_by.is_empty() {
                writeln!(f)?;
                write!(f, "     Required by: {}", node.required_by.join(", "))?;
            }

            if let Some(delay) = node.startup_delay {
                writeln!(f)?;
                write!(f, "     Startup delay: {:?}", delay)?;
            }

            if !node.env.is_empty() {
                let mut env: Vec<_> = node.env.iter().collect();
                env.sort();
                writeln!(f)?;
                write!(f, "     Environment:")?;
                for (key, value) in env {
                    writeln!(f)?;
                    write!(f, "       {}={}", key, value)?;
                }
            }
        }
        writeln!(f)
    }
}
