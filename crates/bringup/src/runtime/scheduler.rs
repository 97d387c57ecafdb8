//! Runs a dependency graph to completion
//!
//! One tokio task drives each launched node through
//! `Launching -> Running -> Waiting -> {Succeeded, Failed, Cancelled}`.
//! The coordinating loop owns the `NotStarted` nodes: it launches whatever
//! `ready_to_launch` returns and cancels the rest once something fails.
//!
//! Every node task writes only its own record and then bumps the version
//! channel, so the coordinator never re-evaluates readiness on a stale
//! snapshot. Cancellation travels on a second watch channel that all probe
//! loops select on.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::runtime::graph::DependencyGraph;
use crate::runtime::invoker::{Handle, Invoker, StopSignal};
use crate::runtime::node::{
    CancelReason, DependencyCondition, FailureReason, NodeState, ServiceNode,
};
use crate::runtime::probe::{ProbeContext, ProbeResult, ProbeSpec};
use crate::runtime::report::{NodeReport, RunReport};

/// Pause between exit checks while waiting out the grace period
const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run-level limits
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whole-run deadline; in-flight nodes fail once it passes
    pub global_timeout: Duration,
    /// Time between SIGTERM and SIGKILL during teardown
    pub grace_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_timeout: Duration::from_secs(600),
            grace_period: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct NodeRecord {
    state: NodeState,
    launched: Option<(Instant, DateTime<Utc>)>,
    finished: Option<(Instant, DateTime<Utc>)>,
}

/// State shared between the coordinator and node tasks
struct Shared {
    records: Mutex<IndexMap<String, NodeRecord>>,
    handles: Mutex<HashMap<String, Handle>>,
    version: watch::Sender<u64>,
    cancel: watch::Sender<Option<CancelReason>>,
}

impl Shared {
    fn new(graph: &DependencyGraph) -> Self {
        let records = graph
            .topological_order()
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    NodeRecord {
                        state: NodeState::NotStarted,
                        launched: None,
                        finished: None,
                    },
                )
            })
            .collect();

        Self {
            records: Mutex::new(records),
            handles: Mutex::new(HashMap::new()),
            version: watch::Sender::new(0),
            cancel: watch::Sender::new(None),
        }
    }

    fn records(&self) -> MutexGuard<'_, IndexMap<String, NodeRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, Handle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a transition and wake the coordinator
    fn transition(&self, id: &str, state: NodeState) {
        {
            let mut records = self.records();
            let Some(record) = records.get_mut(id) else {
                return;
            };
            if record.state.is_terminal() {
                log::warn!(
                    "[{}] Ignoring transition {} -> {}",
                    id,
                    record.state,
                    state
                );
                return;
            }

            log::debug!("[{}] {} -> {}", id, record.state, state);
            if state == NodeState::Launching {
                record.launched = Some((Instant::now(), Utc::now()));
            }
            if state.is_terminal() {
                record.finished = Some((Instant::now(), Utc::now()));
            }
            record.state = state;
        }
        self.version.send_modify(|v| *v += 1);
    }

    fn snapshot(&self) -> HashMap<String, NodeState> {
        self.records()
            .iter()
            .map(|(id, record)| (id.clone(), record.state.clone()))
            .collect()
    }

    fn all_terminal(&self) -> bool {
        self.records().values().all(|r| r.state.is_terminal())
    }

    fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel.borrow().clone()
    }

    /// Raise the cancellation flag; the first reason wins
    fn cancel(&self, reason: CancelReason) {
        let raised = self.cancel.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if raised {
            log::warn!("Cancelling run: {}", reason);
            self.version.send_modify(|v| *v += 1);
        }
    }

    /// Record a failure. The cancel flag goes up first so the coordinator
    /// never evaluates readiness between the two.
    fn fail(&self, id: &str, reason: FailureReason) {
        log::error!("[{}] Failed: {}", id, reason);
        self.cancel(CancelReason::DependencyFailed(id.to_string()));
        self.transition(id, NodeState::Failed(reason));
    }

    fn report(&self, graph: &DependencyGraph, started_at: DateTime<Utc>) -> RunReport {
        let records = self.records();
        let nodes = graph
            .topological_order()
            .iter()
            .filter_map(|id| records.get(id).map(|record| (id, record)))
            .map(|(id, record)| {
                let duration = match (record.launched, record.finished) {
                    (Some((start, _)), Some((end, _))) => end.duration_since(start),
                    _ => Duration::ZERO,
                };
                NodeReport {
                    node: id.clone(),
                    state: record.state.clone(),
                    detail: record.state.detail(),
                    launched_at: record.launched.map(|(_, at)| at),
                    finished_at: record.finished.map(|(_, at)| at),
                    duration,
                }
            })
            .collect();
        RunReport::new(started_at, nodes)
    }
}

/// Resolves once the cancellation flag is raised
async fn cancelled(rx: &mut watch::Receiver<Option<CancelReason>>) -> CancelReason {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone().unwrap_or(CancelReason::Interrupted),
        // Sender gone means the run is being torn down
        Err(_) => CancelReason::Interrupted,
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL
async fn stop_gracefully(invoker: &dyn Invoker, handle: &Handle, grace: Duration) {
    if invoker.exit_code(handle).await.is_some() {
        return;
    }

    log::info!("[{}] Stopping process...", handle.node);
    if let Err(e) = invoker.signal(handle, StopSignal::Stop).await {
        log::warn!("[{}] {}", handle.node, e);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if invoker.exit_code(handle).await.is_some() {
            return;
        }
        tokio::time::sleep(TEARDOWN_POLL_INTERVAL).await;
    }

    log::warn!(
        "[{}] Process did not exit within {:?}, forcing kill",
        handle.node,
        grace
    );
    if let Err(e) = invoker.signal(handle, StopSignal::Kill).await {
        log::error!("[{}] Error killing process: {}", handle.node, e);
    }
}

/// Fail a launched node: cancel the run, stop the process, then record it
async fn fail_launched(
    shared: &Shared,
    invoker: &dyn Invoker,
    handle: &Handle,
    grace: Duration,
    reason: FailureReason,
) {
    log::error!("[{}] Failed: {}", handle.node, reason);
    shared.cancel(CancelReason::DependencyFailed(handle.node.clone()));
    stop_gracefully(invoker, handle, grace).await;
    shared.transition(&handle.node, NodeState::Failed(reason));
}

/// Terminal state for an in-flight node interrupted by `reason`
fn interrupted_state(reason: CancelReason) -> NodeState {
    match reason {
        CancelReason::GlobalTimeout => NodeState::Failed(FailureReason::GlobalTimeout),
        other => NodeState::Cancelled(other),
    }
}

/// Drive one node from `Launching` to a terminal state
async fn run_node(
    shared: Arc<Shared>,
    invoker: Arc<dyn Invoker>,
    node: ServiceNode,
    grace: Duration,
) {
    let id = node.id.as_str();
    let mut cancel_rx = shared.cancel.subscribe();

    if let Some(delay) = node.startup_delay {
        log::debug!("[{}] Waiting {:?} before start", id, delay);
        tokio::select! {
            biased;
            reason = cancelled(&mut cancel_rx) => {
                shared.transition(id, NodeState::Cancelled(reason));
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Never launched, so a deadline here cancels rather than fails
    if let Some(reason) = shared.cancel_reason() {
        shared.transition(id, NodeState::Cancelled(reason));
        return;
    }

    let handle = match invoker.launch(id, &node.launch).await {
        Ok(handle) => handle,
        Err(e) => {
            shared.fail(id, FailureReason::Launch(e.to_string()));
            return;
        }
    };
    shared.handles().insert(id.to_string(), handle.clone());
    shared.transition(id, NodeState::Running);
    shared.transition(id, NodeState::Waiting);

    let source = match node.probe.source().filter(|source| *source != id) {
        Some(source) => {
            let found = shared.handles().get(source).cloned();
            match found {
                Some(source_handle) => Some(source_handle),
                None => {
                    let reason =
                        FailureReason::Probe(format!("source '{}' was never launched", source));
                    fail_launched(&shared, invoker.as_ref(), &handle, grace, reason).await;
                    return;
                }
            }
        }
        None => None,
    };
    let ctx = ProbeContext {
        node: id,
        invoker: invoker.as_ref(),
        handle: &handle,
        source: source.as_ref(),
    };
    let mut watches_exit = !matches!(node.probe, ProbeSpec::ProcessExit);
    let mut probe = node.probe.build();

    loop {
        if watches_exit {
            if let Some(code) = invoker.exit_code(&handle).await {
                match node.required_condition {
                    // A one-shot may finish before its predicate holds
                    DependencyCondition::CompletedSuccessfully if code == 0 => {
                        log::debug!("[{}] Exited cleanly, waiting on the probe", id);
                        watches_exit = false;
                    }
                    DependencyCondition::CompletedSuccessfully => {
                        shared.fail(id, FailureReason::ExitCode(code));
                        return;
                    }
                    DependencyCondition::Started => {
                        shared.fail(id, FailureReason::ExitedBeforeReady(code));
                        return;
                    }
                }
            }
        }

        let result = tokio::select! {
            biased;
            reason = cancelled(&mut cancel_rx) => {
                stop_gracefully(invoker.as_ref(), &handle, grace).await;
                shared.transition(id, interrupted_state(reason));
                return;
            }
            result = probe.poll(&ctx) => result,
        };

        match result {
            ProbeResult::Ready => {
                log::info!("[{}] Reached {}", id, node.required_condition);
                shared.transition(id, NodeState::Succeeded);
                return;
            }
            ProbeResult::Failed(reason) => {
                fail_launched(&shared, invoker.as_ref(), &handle, grace, reason).await;
                return;
            }
            ProbeResult::Pending => {}
        }

        tokio::select! {
            biased;
            reason = cancelled(&mut cancel_rx) => {
                stop_gracefully(invoker.as_ref(), &handle, grace).await;
                shared.transition(id, interrupted_state(reason));
                return;
            }
            _ = tokio::time::sleep(probe.interval()) => {}
        }
    }
}

/// Walks a [`DependencyGraph`] and launches nodes through an [`Invoker`]
pub struct Scheduler {
    invoker: Arc<dyn Invoker>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(invoker: Arc<dyn Invoker>, config: SchedulerConfig) -> Self {
        Self { invoker, config }
    }

    /// Run every node to a terminal state, then stop whatever is still alive.
    ///
    /// A change on `interrupt` cancels the run.
    pub async fn run(
        &self,
        graph: &DependencyGraph,
        mut interrupt: watch::Receiver<()>,
    ) -> RunReport {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.global_timeout;
        let shared = Arc::new(Shared::new(graph));
        let mut version_rx = shared.version.subscribe();
        let mut tasks = JoinSet::new();
        let mut deadline_hit = false;
        let mut interrupted = false;

        log::info!("Bringing up {} nodes...", graph.len());

        loop {
            match shared.cancel_reason() {
                None => {
                    for id in graph.ready_to_launch(&shared.snapshot()) {
                        let Some(node) = graph.node(&id) else {
                            continue;
                        };
                        shared.transition(&id, NodeState::Launching);
                        tasks.spawn(run_node(
                            shared.clone(),
                            self.invoker.clone(),
                            node.clone(),
                            self.config.grace_period,
                        ));
                    }
                }
                Some(reason) => {
                    for (id, state) in shared.snapshot() {
                        if state == NodeState::NotStarted {
                            shared.transition(&id, NodeState::Cancelled(reason.clone()));
                        }
                    }
                }
            }

            if shared.all_terminal() {
                break;
            }

            // A graph whose remaining nodes can never become eligible
            if tasks.is_empty() && shared.cancel_reason().is_none() {
                log::error!("No node can make progress; cancelling the remaining nodes");
                shared.cancel(CancelReason::Interrupted);
                continue;
            }

            tokio::select! {
                changed = version_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        log::error!("Node task aborted: {}", e);
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !deadline_hit => {
                    deadline_hit = true;
                    log::error!(
                        "Global timeout of {:?} elapsed",
                        self.config.global_timeout
                    );
                    shared.cancel(CancelReason::GlobalTimeout);
                }
                changed = interrupt.changed(), if !interrupted => {
                    interrupted = true;
                    // A dropped sender only means nobody can interrupt any more
                    if changed.is_ok() {
                        log::info!("Interrupt received, cancelling run");
                        shared.cancel(CancelReason::Interrupted);
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Node task aborted: {}", e);
            }
        }

        self.teardown(graph, &shared).await;

        let report = shared.report(graph, started_at);
        if report.success {
            log::info!("All {} nodes succeeded", report.nodes.len());
        } else {
            log::error!("Bring-up failed");
        }
        report
    }

    /// Stop surviving processes in reverse launch order
    async fn teardown(&self, graph: &DependencyGraph, shared: &Shared) {
        let handles: Vec<Handle> = {
            let handles = shared.handles();
            graph
                .topological_order()
                .iter()
                .rev()
                .filter_map(|id| handles.get(id).cloned())
                .collect()
        };

        for handle in handles {
            stop_gracefully(self.invoker.as_ref(), &handle, self.config.grace_period).await;
        }
    }
}
