//! In-memory invoker for scheduler scenarios. Time is tokio time, so tests
//! run with `start_paused` and finish instantly.

#![allow(dead_code)]

use async_trait::async_trait;
use bringup::runtime::{
    CheckCommand, CheckOutput, DependencyCondition, Handle, Invoker, InvokerError, LaunchSpec,
    PollingCommandSpec, PredicateSpec, ProbeSpec, ServiceNode, StopSignal,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How a launched node behaves
#[derive(Debug, Clone, Default)]
pub struct NodeScript {
    /// Exit with this code after this long
    pub exit_after: Option<(Duration, i32)>,
    pub fail_launch: bool,
    /// Survives SIGTERM; only SIGKILL stops it
    pub ignore_stop: bool,
}

/// How a check command answers, keyed by program name
#[derive(Debug, Clone)]
pub enum CheckScript {
    /// Answers in order; the last one repeats
    Sequence(VecDeque<CheckOutput>),
    /// Succeeds once `node` has been up for `delay`
    ReadyAfter { node: String, delay: Duration },
    /// Prints `value` on stdout, always exit 0
    Value(f64),
}

#[derive(Debug)]
struct Process {
    node: String,
    launched_at: Instant,
    exit_at: Option<(Instant, i32)>,
    stopped: Option<i32>,
    ignore_stop: bool,
}

impl Process {
    fn exit_code(&self) -> Option<i32> {
        if self.stopped.is_some() {
            return self.stopped;
        }
        match self.exit_at {
            Some((at, code)) if Instant::now() >= at => Some(code),
            _ => None,
        }
    }
}

/// Everything the scheduler did, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Launched { node: String, at: Instant },
    Signalled { node: String, signal: StopSignal },
    Checked { program: String, at: Instant },
}

#[derive(Default)]
pub struct ScriptedInvoker {
    next_id: AtomicU64,
    scripts: Mutex<HashMap<String, NodeScript>>,
    checks: Mutex<HashMap<String, CheckScript>>,
    processes: Mutex<HashMap<u64, Process>>,
    specs: Mutex<HashMap<String, LaunchSpec>>,
    events: Mutex<Vec<Event>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, node: &str, script: NodeScript) -> Self {
        self.scripts.lock().unwrap().insert(node.to_string(), script);
        self
    }

    /// Node that exits with `code` after `after`
    pub fn with_exit(self, node: &str, after: Duration, code: i32) -> Self {
        self.with_node(
            node,
            NodeScript {
                exit_after: Some((after, code)),
                ..Default::default()
            },
        )
    }

    pub fn with_check(self, program: &str, script: CheckScript) -> Self {
        self.checks.lock().unwrap().insert(program.to_string(), script);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn launch_order(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Launched { node, .. } => Some(node),
                _ => None,
            })
            .collect()
    }

    pub fn launched_at(&self, node: &str) -> Option<Instant> {
        self.events().into_iter().find_map(|e| match e {
            Event::Launched { node: n, at } if n == node => Some(at),
            _ => None,
        })
    }

    /// When `node` stopped by itself, if it did
    pub fn exited_at(&self, node: &str) -> Option<Instant> {
        self.processes
            .lock()
            .unwrap()
            .values()
            .find(|p| p.node == node)
            .and_then(|p| p.exit_at.map(|(at, _)| at))
    }

    pub fn signals(&self, node: &str) -> Vec<StopSignal> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Signalled { node: n, signal } if n == node => Some(signal),
                _ => None,
            })
            .collect()
    }

    pub fn check_count(&self, program: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Checked { program: p, .. } if p == program))
            .count()
    }

    pub fn spec_of(&self, node: &str) -> Option<LaunchSpec> {
        self.specs.lock().unwrap().get(node).cloned()
    }

    /// Nodes whose process has not exited
    pub fn alive(&self) -> Vec<String> {
        self.processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.exit_code().is_none())
            .map(|p| p.node.clone())
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn launch(&self, node: &str, spec: &LaunchSpec) -> Result<Handle, InvokerError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default();
        if script.fail_launch {
            return Err(InvokerError::Other(format!("{} not found", spec.executable)));
        }

        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().insert(
            id,
            Process {
                node: node.to_string(),
                launched_at: now,
                exit_at: script.exit_after.map(|(after, code)| (now + after, code)),
                stopped: None,
                ignore_stop: script.ignore_stop,
            },
        );
        self.specs
            .lock()
            .unwrap()
            .insert(node.to_string(), spec.clone());
        self.record(Event::Launched {
            node: node.to_string(),
            at: now,
        });

        Ok(Handle {
            id,
            node: node.to_string(),
            pid: None,
        })
    }

    async fn signal(&self, handle: &Handle, signal: StopSignal) -> Result<(), InvokerError> {
        self.record(Event::Signalled {
            node: handle.node.clone(),
            signal,
        });
        let mut processes = self.processes.lock().unwrap();
        let process = processes
            .get_mut(&handle.id)
            .ok_or(InvokerError::UnknownHandle(handle.id))?;
        if process.exit_code().is_some() {
            return Ok(());
        }
        match signal {
            StopSignal::Stop if !process.ignore_stop => process.stopped = Some(143),
            StopSignal::Stop => {}
            StopSignal::Kill => process.stopped = Some(137),
        }
        Ok(())
    }

    async fn exit_code(&self, handle: &Handle) -> Option<i32> {
        self.processes
            .lock()
            .unwrap()
            .get(&handle.id)
            .and_then(Process::exit_code)
    }

    async fn exec(&self, check: &CheckCommand) -> Result<CheckOutput, InvokerError> {
        self.record(Event::Checked {
            program: check.program.clone(),
            at: Instant::now(),
        });

        let mut checks = self.checks.lock().unwrap();
        let script = checks
            .get_mut(&check.program)
            .ok_or_else(|| InvokerError::Other(format!("no script for {}", check.program)))?;

        let output = match script {
            CheckScript::Sequence(outputs) => {
                let next = if outputs.len() > 1 {
                    outputs.pop_front()
                } else {
                    outputs.front().cloned()
                };
                next.unwrap_or_else(|| output(1, ""))
            }
            CheckScript::ReadyAfter { node, delay } => {
                let ready = self
                    .processes
                    .lock()
                    .unwrap()
                    .values()
                    .any(|p| &p.node == node && Instant::now() >= p.launched_at + *delay);
                if ready {
                    output(0, "")
                } else {
                    output(1, "")
                }
            }
            CheckScript::Value(value) => output(0, &value.to_string()),
        };
        Ok(output)
    }
}

pub fn output(code: i32, stdout: &str) -> CheckOutput {
    CheckOutput {
        code: Some(code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn sequence(codes: &[i32]) -> CheckScript {
    CheckScript::Sequence(codes.iter().map(|c| output(*c, "")).collect())
}

pub fn one_shot(id: &str) -> ServiceNode {
    ServiceNode::one_shot(id, LaunchSpec::new(format!("bin/{}", id)))
}

/// Long-running service gated on `program` succeeding
pub fn service(id: &str, program: &str, interval: Duration, retries: u32) -> ServiceNode {
    let check = CheckCommand::from_argv(&[program.to_string()]).unwrap();
    ServiceNode::new(
        id,
        LaunchSpec::new(format!("bin/{}", id)),
        ProbeSpec::PollingCommand(PollingCommandSpec {
            check,
            interval,
            timeout: Duration::from_secs(30),
            retries,
            start_period: Duration::ZERO,
        }),
        DependencyCondition::Started,
    )
}

/// Service gated on a value read by `program`
pub fn predicate_service(id: &str, program: &str, threshold: f64, timeout: Duration) -> ServiceNode {
    let query = CheckCommand::from_argv(&[program.to_string()]).unwrap();
    ServiceNode::new(
        id,
        LaunchSpec::new(format!("bin/{}", id)),
        ProbeSpec::ConditionPredicate(PredicateSpec {
            source: None,
            query,
            comparison: bringup::runtime::Comparison::GreaterOrEqual,
            threshold,
            interval: Duration::from_secs(5),
            timeout,
        }),
        DependencyCondition::Started,
    )
}

/// Prints each value in turn; the last one repeats
pub fn values(values: &[f64]) -> CheckScript {
    CheckScript::Sequence(values.iter().map(|v| output(0, &v.to_string())).collect())
}

/// One-shot verification step reading a value exposed by `source`
pub fn verification(
    id: &str,
    program: &str,
    source: &str,
    threshold: f64,
    timeout: Duration,
) -> ServiceNode {
    let query = CheckCommand::from_argv(&[program.to_string()]).unwrap();
    ServiceNode::new(
        id,
        LaunchSpec::new(format!("bin/{}", id)),
        ProbeSpec::ConditionPredicate(PredicateSpec {
            source: Some(source.to_string()),
            query,
            comparison: bringup::runtime::Comparison::GreaterOrEqual,
            threshold,
            interval: Duration::from_secs(5),
            timeout,
        }),
        DependencyCondition::CompletedSuccessfully,
    )
}
