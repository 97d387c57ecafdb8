//! Readiness probes
//!
//! A probe answers one question per call: is the node there yet? The
//! scheduler owns the loop, the sleeping between polls and cancellation, so
//! every probe here can be driven step by step in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::runtime::invoker::{CheckCommand, Handle, Invoker};
use crate::runtime::node::{DependencyCondition, FailureReason};

/// Pause between exit-code checks of one-shot tasks
pub const PROCESS_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of a single poll
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Pending,
    Ready,
    Failed(FailureReason),
}

/// Comparison applied by a predicate probe: `value <op> threshold`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "<")]
    Less,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Greater => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::Equal => (value - threshold).abs() < f64::EPSILON,
            Comparison::LessOrEqual => value <= threshold,
            Comparison::Less => value < threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Equal => "==",
            Comparison::LessOrEqual => "<=",
            Comparison::Less => "<",
        }
    }
}

/// Retrying health check command
#[derive(Debug, Clone, PartialEq)]
pub struct PollingCommandSpec {
    pub check: CheckCommand,
    pub interval: Duration,
    /// Limit for a single attempt
    pub timeout: Duration,
    /// Consecutive failures tolerated before giving up
    pub retries: u32,
    /// Failures inside this window after the first poll are not counted
    pub start_period: Duration,
}

/// Threshold check on a value read from a running service
#[derive(Debug, Clone, PartialEq)]
pub struct PredicateSpec {
    /// Node whose exit fails the probe; the probed node itself when `None`
    pub source: Option<String>,
    /// Command printing the value on stdout
    pub query: CheckCommand,
    pub comparison: Comparison,
    pub threshold: f64,
    pub interval: Duration,
    /// The predicate has to hold within this window; there is no retry budget
    pub timeout: Duration,
}

/// Probe configuration attached to a node
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeSpec {
    ProcessExit,
    PollingCommand(PollingCommandSpec),
    ConditionPredicate(PredicateSpec),
}

impl ProbeSpec {
    /// Whether a `Ready` from this probe means a node reached `condition`
    pub fn satisfies(&self, condition: DependencyCondition) -> bool {
        match self {
            ProbeSpec::ProcessExit => condition == DependencyCondition::CompletedSuccessfully,
            ProbeSpec::PollingCommand(_) => condition == DependencyCondition::Started,
            ProbeSpec::ConditionPredicate(_) => true,
        }
    }

    /// Node whose handle the probe reads, if not the probed node
    pub fn source(&self) -> Option<&str> {
        match self {
            ProbeSpec::ConditionPredicate(spec) => spec.source.as_deref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProbeSpec::ProcessExit => "process_exit",
            ProbeSpec::PollingCommand(_) => "command",
            ProbeSpec::ConditionPredicate(_) => "predicate",
        }
    }

    /// One-line summary for the launch plan
    pub fn describe(&self) -> String {
        match self {
            ProbeSpec::ProcessExit => "exit code 0".to_string(),
            ProbeSpec::PollingCommand(spec) => format!(
                "`{}` every {:?} (timeout {:?}, retries {})",
                spec.check.command_line(),
                spec.interval,
                spec.timeout,
                spec.retries
            ),
            ProbeSpec::ConditionPredicate(spec) => format!(
                "`{}` {} {} within {:?}",
                spec.query.command_line(),
                spec.comparison.symbol(),
                spec.threshold,
                spec.timeout
            ),
        }
    }

    /// Fresh probe state for one run
    pub fn build(&self) -> Box<dyn HealthProbe> {
        match self {
            ProbeSpec::ProcessExit => Box::new(ProcessExitProbe),
            ProbeSpec::PollingCommand(spec) => Box::new(PollingCommandProbe::new(spec.clone())),
            ProbeSpec::ConditionPredicate(spec) => Box::new(PredicateProbe::new(spec.clone())),
        }
    }
}

/// What a probe may look at during a poll
pub struct ProbeContext<'a> {
    pub node: &'a str,
    pub invoker: &'a dyn Invoker,
    pub handle: &'a Handle,
    pub source: Option<&'a Handle>,
}

#[async_trait]
pub trait HealthProbe: Send {
    async fn poll(&mut self, ctx: &ProbeContext<'_>) -> ProbeResult;

    /// Pause the scheduler inserts between polls
    fn interval(&self) -> Duration;
}

/// Ready once the launched process exits 0
pub struct ProcessExitProbe;

#[async_trait]
impl HealthProbe for ProcessExitProbe {
    async fn poll(&mut self, ctx: &ProbeContext<'_>) -> ProbeResult {
        match ctx.invoker.exit_code(ctx.handle).await {
            None => ProbeResult::Pending,
            Some(0) => ProbeResult::Ready,
            Some(code) => ProbeResult::Failed(FailureReason::ExitCode(code)),
        }
    }

    fn interval(&self) -> Duration {
        PROCESS_EXIT_POLL_INTERVAL
    }
}

pub struct PollingCommandProbe {
    spec: PollingCommandSpec,
    consecutive_failures: u32,
    first_poll: Option<Instant>,
}

impl PollingCommandProbe {
    pub fn new(spec: PollingCommandSpec) -> Self {
        Self {
            spec,
            consecutive_failures: 0,
            first_poll: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn record_failure(&mut self, node: &str, in_start_period: bool, error: String) -> ProbeResult {
        if in_start_period {
            log::debug!("[{}] Check failed during start period: {}", node, error);
            return ProbeResult::Pending;
        }

        self.consecutive_failures += 1;
        let budget = self.spec.retries.max(1);
        log::debug!(
            "[{}] Check failed ({}/{}): {}",
            node,
            self.consecutive_failures,
            budget,
            error
        );

        if self.consecutive_failures >= budget {
            ProbeResult::Failed(FailureReason::ProbeExhausted {
                attempts: self.consecutive_failures,
                last_error: error,
            })
        } else {
            ProbeResult::Pending
        }
    }
}

#[async_trait]
impl HealthProbe for PollingCommandProbe {
    async fn poll(&mut self, ctx: &ProbeContext<'_>) -> ProbeResult {
        let now = Instant::now();
        let first = *self.first_poll.get_or_insert(now);
        let in_start_period = now.duration_since(first) < self.spec.start_period;

        let attempt = tokio::time::timeout(self.spec.timeout, ctx.invoker.exec(&self.spec.check));
        match attempt.await {
            Ok(Ok(output)) if output.success() => {
                self.consecutive_failures = 0;
                ProbeResult::Ready
            }
            Ok(Ok(output)) => {
                let error = match output.code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                };
                self.record_failure(ctx.node, in_start_period, error)
            }
            Ok(Err(e)) => self.record_failure(ctx.node, in_start_period, e.to_string()),
            Err(_) => self.record_failure(
                ctx.node,
                in_start_period,
                format!("attempt timed out after {:?}", self.spec.timeout),
            ),
        }
    }

    fn interval(&self) -> Duration {
        self.spec.interval
    }
}

pub struct PredicateProbe {
    spec: PredicateSpec,
    deadline: Option<Instant>,
}

impl PredicateProbe {
    pub fn new(spec: PredicateSpec) -> Self {
        Self {
            spec,
            deadline: None,
        }
    }
}

#[async_trait]
impl HealthProbe for PredicateProbe {
    async fn poll(&mut self, ctx: &ProbeContext<'_>) -> ProbeResult {
        let deadline = *self
            .deadline
            .get_or_insert_with(|| Instant::now() + self.spec.timeout);

        let source = ctx.source.unwrap_or(ctx.handle);
        if ctx.invoker.exit_code(source).await.is_some() {
            return ProbeResult::Failed(FailureReason::SourceExited(source.node.clone()));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ProbeResult::Failed(FailureReason::ProbeTimeout(self.spec.timeout));
        }

        let output = match tokio::time::timeout(remaining, ctx.invoker.exec(&self.spec.query)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ProbeResult::Failed(FailureReason::Probe(e.to_string())),
            Err(_) => return ProbeResult::Failed(FailureReason::ProbeTimeout(self.spec.timeout)),
        };

        if !output.success() {
            log::debug!("[{}] Query exited with {:?}", ctx.node, output.code);
            return ProbeResult::Pending;
        }

        match output.stdout.trim().parse::<f64>() {
            Ok(value) if self.spec.comparison.holds(value, self.spec.threshold) => {
                log::info!(
                    "[{}] Condition met: {} {} {}",
                    ctx.node,
                    value,
                    self.spec.comparison.symbol(),
                    self.spec.threshold
                );
                ProbeResult::Ready
            }
            Ok(value) => {
                log::debug!(
                    "[{}] Condition not met yet: {} {} {}",
                    ctx.node,
                    value,
                    self.spec.comparison.symbol(),
                    self.spec.threshold
                );
                ProbeResult::Pending
            }
            Err(_) => {
                log::debug!(
                    "[{}] Query output is not a number: {:?}",
                    ctx.node,
                    output.stdout.trim()
                );
                ProbeResult::Pending
            }
        }
    }

    fn interval(&self) -> Duration {
        self.spec.interval
    }
}
