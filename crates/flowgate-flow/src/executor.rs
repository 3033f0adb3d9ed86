use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowgate_core::config::{ExecutorConfig, LOOP_ITERATION_CEILING};
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::EventBus;
use flowgate_core::flow::{Edge, Flow, Node, StepKind};
use flowgate_core::record::{ExecutionRecord, NodeErrorRecord, RunStatus};
use flowgate_core::traits::ExecutionStore;
use flowgate_core::types::{ExecutionId, FlowEvent, TriggerInfo};

use crate::context::ExecutionContext;
use crate::graph::{descendants, effective_edges, roots, topological_order, validate_flow};
use crate::registry::StepRegistry;
use crate::resolver::VariableResolver;
use crate::result::{codes, NodeExecutionResult};
use crate::step::{config_u64, StepInput};
use crate::steps::logic::{RetryPolicy, BODY_BRANCH, DONE_BRANCH};

const ERROR_HANDLE: &str = "error";

/// Per-run inputs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reusing an id replays outputs already logged for it.
    pub execution_id: Option<ExecutionId>,
    pub input: Value,
    pub trigger: Option<TriggerInfo>,
    pub cancel: Option<CancellationToken>,
    pub variables: HashMap<String, Value>,
}

impl RunOptions {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn with_execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerInfo) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// Result of a run that passed validation.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub record: ExecutionRecord,
    /// Final run variables.
    pub variables: HashMap<String, Value>,
    /// Node ids in the order they executed (loop bodies once per iteration).
    pub executed: Vec<String>,
}

impl ExecutionOutcome {
    pub fn status(&self) -> RunStatus {
        self.record.status
    }

    /// Completed with every node error handled.
    pub fn is_success(&self) -> bool {
        self.record.succeeded()
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.record.node_outputs.get(node_id)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// How a sequence of nodes ended.
#[derive(Debug, Clone, PartialEq)]
enum Control {
    Continue,
    Abort(String),
    Cancelled,
}

enum LoopEnd {
    Finished(Value),
    Failed(NodeExecutionResult),
    Stop(Control),
}

struct RunState<'f> {
    flow: &'f Flow,
    edges: Vec<Edge>,
    order: Vec<String>,
    ctx: ExecutionContext,
    activated: HashSet<String>,
    done: HashSet<String>,
    executed: Vec<String>,
    node_errors: Vec<NodeErrorRecord>,
    used_handlers: HashSet<String>,
    replay: BTreeMap<String, Value>,
}

impl RunState<'_> {
    fn exec_id(&self) -> String {
        self.ctx.execution_id.to_string()
    }

    fn ordered(&self, ids: &HashSet<String>) -> Vec<String> {
        self.order.iter().filter(|id| ids.contains(*id)).cloned().collect()
    }
}

/// Removes the execution id from the active set when the run ends.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl ActiveGuard {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, id: &str) -> Result<Self> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return Err(FlowgateError::ExecutionActive(id.to_string()));
        }
        Ok(Self {
            active: active.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

/// Runs flows. One instance serves many concurrent runs; runs share only the
/// read-only registry and resolver.
pub struct FlowExecutor {
    registry: Arc<StepRegistry>,
    resolver: Arc<VariableResolver>,
    events: Arc<EventBus>,
    store: Option<Arc<dyn ExecutionStore>>,
    config: ExecutorConfig,
    active: Arc<Mutex<HashSet<String>>>,
}

impl FlowExecutor {
    pub fn new(
        registry: Arc<StepRegistry>,
        resolver: Arc<VariableResolver>,
        events: Arc<EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            events,
            store: None,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Persist run records and the per-node replay log.
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Structural problems that would stop `flow` from running.
    pub fn validate(&self, flow: &Flow) -> Vec<String> {
        validate_flow(flow, &self.registry)
    }

    /// Whether a run with this id is in progress.
    pub fn is_active(&self, execution_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(execution_id)
    }

    fn emit(&self, event: FlowEvent) {
        self.events.publish(event);
    }

    /// Run `flow` to a terminal state.
    ///
    /// Validation problems (cycles, unknown executors, bad config) return `Err`
    /// before any node runs. Runtime failures return `Ok` with a `Failed` or
    /// `Cancelled` record holding the partial outputs.
    pub async fn execute(&self, flow: &Flow, opts: RunOptions) -> Result<ExecutionOutcome> {
        let execution_id = opts.execution_id.unwrap_or_default();
        let exec = execution_id.to_string();
        let _guard = ActiveGuard::acquire(&self.active, &exec)?;

        let edges = effective_edges(flow);
        let errors = self.validate(flow);
        if !errors.is_empty() {
            let err = match topological_order(flow, &edges) {
                Err(cycle) => cycle,
                Ok(_) => FlowgateError::InvalidFlow(errors),
            };
            warn!(execution_id = %exec, flow_id = %flow.id, error = %err, "Flow rejected");
            self.emit(FlowEvent::ExecutionError {
                execution_id: exec,
                error: err.to_string(),
            });
            return Err(err);
        }
        let order = topological_order(flow, &edges)?;

        let replay = match &self.store {
            Some(store) => store.load_node_outputs(&exec).await.unwrap_or_else(|e| {
                warn!(execution_id = %exec, error = %e, "Failed to load replay log");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        let input = opts.input;
        let mut ctx = ExecutionContext::new(execution_id, flow.id.clone(), input.clone())
            .with_trigger(opts.trigger.unwrap_or_else(TriggerInfo::manual))
            .with_cancel(opts.cancel.unwrap_or_default());
        for (name, value) in opts.variables {
            ctx = ctx.with_variable(name, value);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            execution_id = %exec,
            flow_id = %flow.id,
            nodes = flow.nodes.len(),
            replayed = replay.len(),
            "Flow execution started"
        );
        self.emit(FlowEvent::ExecutionStart {
            execution_id: exec.clone(),
            flow_id: flow.id.clone(),
        });

        let mut state = RunState {
            flow,
            activated: roots(flow, &edges).into_iter().collect(),
            edges,
            order: order.clone(),
            ctx,
            done: HashSet::new(),
            executed: vec![],
            node_errors: vec![],
            used_handlers: HashSet::new(),
            replay,
        };

        let control = self.run_nodes(&mut state, order).await;

        let (status, run_error) = match control {
            Control::Continue => (RunStatus::Completed, None),
            Control::Abort(msg) => (RunStatus::Failed, Some(msg)),
            Control::Cancelled => (RunStatus::Cancelled, Some(FlowgateError::Cancelled.to_string())),
        };

        let output = state.ctx.node_outputs().to_value();
        let skipped: Vec<String> = flow
            .nodes
            .iter()
            .filter(|n| !state.done.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let record = ExecutionRecord {
            execution_id: exec.clone(),
            flow_id: flow.id.clone(),
            status,
            input,
            output: output.clone(),
            node_outputs: state.ctx.node_outputs().to_map(),
            node_errors: state.node_errors,
            skipped,
            error: run_error.clone(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        match status {
            RunStatus::Completed => {
                info!(
                    execution_id = %exec,
                    success = record.succeeded(),
                    duration_ms = record.duration_ms,
                    "Flow execution complete"
                );
                self.emit(FlowEvent::ExecutionComplete {
                    execution_id: exec.clone(),
                    success: record.succeeded(),
                    output,
                });
            }
            _ => {
                let error = run_error.unwrap_or_default();
                warn!(execution_id = %exec, status = %status, error = %error, "Flow execution ended");
                self.emit(FlowEvent::ExecutionError {
                    execution_id: exec.clone(),
                    error,
                });
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save_execution_record(&record).await {
                error!(execution_id = %exec, error = %e, "Failed to save execution record");
            }
        }

        Ok(ExecutionOutcome {
            record,
            variables: state.ctx.variables().clone(),
            executed: state.executed,
        })
    }

    /// Run `ids` in order, skipping nodes that are done or not activated.
    fn run_nodes<'a, 'f: 'a>(
        &'a self,
        state: &'a mut RunState<'f>,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Control> {
        Box::pin(async move {
            let flow: &'f Flow = state.flow;
            for id in ids {
                if state.done.contains(&id) || !state.activated.contains(&id) {
                    continue;
                }
                if state.ctx.is_cancelled() {
                    info!(execution_id = %state.exec_id(), node_id = %id, "Cancelled before node");
                    return Control::Cancelled;
                }
                let Some(node) = flow.node(&id) else {
                    continue;
                };

                if !state.ctx.in_iteration() {
                    if let Some(output) = state.replay.get(&id).cloned() {
                        if let Err(e) = self.restore(state, node, output) {
                            return Control::Abort(e.to_string());
                        }
                        continue;
                    }
                }

                match self.execute_node(state, node).await {
                    Control::Continue => {}
                    other => return other,
                }
            }
            Control::Continue
        })
    }

    /// Restore a logged output instead of executing the node again.
    fn restore(&self, state: &mut RunState<'_>, node: &Node, output: Value) -> Result<()> {
        debug!(execution_id = %state.exec_id(), node_id = %node.id, "Replaying node output");
        if node.kind == StepKind::SetVariable {
            self.commit_variable(state, &output);
        }
        state.ctx.record_output(&node.id, output.clone())?;
        state.done.insert(node.id.clone());

        if node.kind == StepKind::Loop {
            let body = self.loop_body(state, node).0;
            for id in state.ordered(&body) {
                if let Some(out) = state.replay.get(&id).cloned() {
                    state.ctx.record_output(&id, out)?;
                    state.done.insert(id);
                }
            }
        }

        self.emit(FlowEvent::NodeComplete {
            execution_id: state.exec_id(),
            node_id: node.id.clone(),
            output: output.clone(),
            replayed: true,
        });
        self.activate(state, node, &NodeExecutionResult::success(output));
        Ok(())
    }

    async fn execute_node(&self, state: &mut RunState<'_>, node: &Node) -> Control {
        let exec = state.exec_id();
        info!(execution_id = %exec, node_id = %node.id, kind = %node.kind, "Executing node");
        self.emit(FlowEvent::NodeStart {
            execution_id: exec.clone(),
            node_id: node.id.clone(),
            kind: node.kind.to_string(),
        });
        state.executed.push(node.id.clone());

        let mut result = self.invoke(state, node).await;

        if result.success && node.kind == StepKind::Loop {
            let plan = result.data.take().unwrap_or(Value::Null);
            result = match self.run_loop(state, node, plan).await {
                LoopEnd::Finished(output) => NodeExecutionResult::success(output),
                LoopEnd::Failed(failure) => failure,
                LoopEnd::Stop(control) => return control,
            };
        }

        if result.success {
            self.complete(state, node, result).await
        } else {
            self.fail(state, node, result).await
        }
    }

    /// Resolve config, then run the step under its timeout.
    async fn invoke(&self, state: &RunState<'_>, node: &Node) -> NodeExecutionResult {
        let Some(step) = self.registry.get(node.kind) else {
            return NodeExecutionResult::failure(
                format!("no executor registered for '{}'", node.kind),
                codes::VALIDATION,
            );
        };
        let config = self.resolver.resolve_config(node.config(), &state.ctx);
        let timeout = step
            .timeout_hint(&config)
            .or_else(|| config_u64(&config, "timeoutMs").map(Duration::from_millis))
            .unwrap_or(Duration::from_millis(self.config.node_timeout_ms));

        let input = StepInput {
            node,
            config,
            context: &state.ctx,
        };
        match tokio::time::timeout(timeout, step.execute(input)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    execution_id = %state.exec_id(),
                    node_id = %node.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Node timed out"
                );
                NodeExecutionResult::timeout(timeout.as_millis() as u64)
            }
        }
    }

    fn commit_variable(&self, state: &mut RunState<'_>, data: &Value) {
        if let Some(name) = data.get("name").and_then(|n| n.as_str()) {
            let value = data.get("value").cloned().unwrap_or(Value::Null);
            state.ctx.set_variable(name, value);
        }
    }

    async fn complete(
        &self,
        state: &mut RunState<'_>,
        node: &Node,
        result: NodeExecutionResult,
    ) -> Control {
        let data = result.data.clone().unwrap_or(Value::Null);
        if node.kind == StepKind::SetVariable {
            self.commit_variable(state, &data);
        }
        if let Err(e) = state.ctx.record_output(&node.id, data.clone()) {
            return Control::Abort(e.to_string());
        }
        state.done.insert(node.id.clone());

        let exec = state.exec_id();
        if !state.ctx.in_iteration() {
            self.log_output(&exec, &node.id, &data).await;
        }
        debug!(execution_id = %exec, node_id = %node.id, "Node complete");
        self.emit(FlowEvent::NodeComplete {
            execution_id: exec,
            node_id: node.id.clone(),
            output: data,
            replayed: false,
        });
        self.activate(state, node, &result);
        Control::Continue
    }

    async fn log_output(&self, exec: &str, node_id: &str, data: &Value) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append_node_output(exec, node_id, data).await {
                warn!(execution_id = %exec, node_id = %node_id, error = %e, "Failed to append replay log");
            }
        }
    }

    /// Mark successors of a completed node as runnable.
    fn activate(&self, state: &mut RunState<'_>, node: &Node, result: &NodeExecutionResult) {
        let branch = if node.kind.is_control_flow() {
            result.branch()
        } else {
            None
        };
        let targets: Vec<String> = match (&result.next_nodes, branch) {
            (Some(next), _) => next.clone(),
            (None, Some(branch)) => state
                .edges
                .iter()
                .filter(|e| e.source == node.id && e.handle() == Some(branch))
                .map(|e| e.target.clone())
                .collect(),
            (None, None) => state
                .edges
                .iter()
                .filter(|e| {
                    e.source == node.id && !matches!(e.handle(), Some(ERROR_HANDLE) | Some(BODY_BRANCH))
                })
                .map(|e| e.target.clone())
                .collect(),
        };
        state.activated.extend(targets);
    }

    /// Handler for a failing node: `error` handle (edge or `outputs.error`),
    /// else a flow-scoped error handler with no incoming edges.
    fn find_handler<'f>(&self, state: &RunState<'f>, failing: &Node) -> Option<&'f Node> {
        let flow: &'f Flow = state.flow;
        let usable = |n: &&Node| n.id != failing.id && !state.used_handlers.contains(&n.id);

        let wired = state
            .edges
            .iter()
            .filter(|e| e.source == failing.id && e.handle() == Some(ERROR_HANDLE))
            .filter_map(|e| flow.node(&e.target))
            .find(usable);
        if wired.is_some() {
            return wired;
        }

        flow.nodes
            .iter()
            .filter(|n| n.kind == StepKind::ErrorHandler)
            .filter(|n| !state.edges.iter().any(|e| e.target == n.id))
            .find(usable)
    }

    async fn fail(
        &self,
        state: &mut RunState<'_>,
        node: &Node,
        mut result: NodeExecutionResult,
    ) -> Control {
        let exec = state.exec_id();
        self.report_failure(&exec, node, &result);

        let handler = self.find_handler(state, node);

        if let (Some(handler), true) = (handler, result.is_recoverable) {
            let handler_config = self.resolver.resolve_config(handler.config(), &state.ctx);
            let policy = RetryPolicy::from_config(
                &handler_config,
                Duration::from_millis(self.config.default_retry_backoff_ms),
                Duration::from_millis(self.config.max_retry_backoff_ms),
            );
            let cancel = state.ctx.cancellation_token();
            for attempt in 1..=policy.max_retries {
                let delay = policy.delay_for(attempt);
                info!(
                    execution_id = %exec,
                    node_id = %node.id,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Retrying node"
                );
                self.emit(FlowEvent::NodeRetry {
                    execution_id: exec.clone(),
                    node_id: node.id.clone(),
                    attempt,
                    backoff_ms: delay.as_millis() as u64,
                });
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = cancel.cancelled() => true,
                };
                if cancelled {
                    // The node ends here; its last failure stays on record.
                    state.done.insert(node.id.clone());
                    state.node_errors.push(error_record(node, &result, None));
                    return Control::Cancelled;
                }

                result = self.invoke(state, node).await;
                if result.success {
                    return self.complete(state, node, result).await;
                }
                self.report_failure(&exec, node, &result);
                if !result.is_recoverable {
                    break;
                }
            }
        }

        state.done.insert(node.id.clone());
        state
            .node_errors
            .push(error_record(node, &result, handler.map(|h| h.id.clone())));

        if let Some(handler) = handler {
            info!(execution_id = %exec, node_id = %node.id, handler = %handler.id, "Transferring to error handler");
            state.used_handlers.insert(handler.id.clone());
            state.ctx.set_variable(
                "error",
                json!({
                    "nodeId": node.id,
                    "message": result.error_message(),
                    "code": result.error_code(),
                    "recoverable": result.is_recoverable,
                }),
            );
            state.activated.insert(handler.id.clone());
            let reach = descendants(&state.edges, &[handler.id.clone()]);
            let ids = state.ordered(&reach);
            return self.run_nodes(state, ids).await;
        }

        if result.is_recoverable {
            warn!(
                execution_id = %exec,
                node_id = %node.id,
                "Recoverable failure with no handler, skipping dependents"
            );
            Control::Continue
        } else {
            Control::Abort(format!("node '{}' failed: {}", node.id, result.error_message()))
        }
    }

    fn report_failure(&self, exec: &str, node: &Node, result: &NodeExecutionResult) {
        warn!(
            execution_id = %exec,
            node_id = %node.id,
            code = %result.error_code(),
            recoverable = result.is_recoverable,
            error = %result.error_message(),
            "Node failed"
        );
        self.emit(FlowEvent::NodeError {
            execution_id: exec.to_string(),
            node_id: node.id.clone(),
            error: result.error_message().to_string(),
        });
    }

    /// Body of a loop (reachable from its `body` branch but not from `done`)
    /// and the body entry nodes.
    fn loop_body(&self, state: &RunState<'_>, node: &Node) -> (HashSet<String>, Vec<String>) {
        let starts = |handle: &str| -> Vec<String> {
            state
                .edges
                .iter()
                .filter(|e| e.source == node.id && e.handle() == Some(handle))
                .map(|e| e.target.clone())
                .collect()
        };
        let body_starts = starts(BODY_BRANCH);
        let after = descendants(&state.edges, &starts(DONE_BRANCH));
        let mut body = descendants(&state.edges, &body_starts);
        body.retain(|id| !after.contains(id) && *id != node.id);
        (body, body_starts)
    }

    async fn run_loop(&self, state: &mut RunState<'_>, node: &Node, plan: Value) -> LoopEnd {
        if state.ctx.in_iteration() {
            return LoopEnd::Failed(NodeExecutionResult::failure(
                "nested loops are not supported",
                codes::VALIDATION,
            ));
        }
        let items = match plan.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![],
        };
        let limit = plan
            .get("maxIterations")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or_else(|| self.config.loop_limit())
            .min(LOOP_ITERATION_CEILING);
        let iterations = items.len().min(limit);
        let completed = items.len() <= limit;

        let (body, body_starts) = self.loop_body(state, node);
        let body_order = state.ordered(&body);
        let exec = state.exec_id();
        info!(
            execution_id = %exec,
            node_id = %node.id,
            items = items.len(),
            iterations,
            "Entering loop"
        );

        let mut results = Vec::with_capacity(iterations);
        for (index, item) in items.into_iter().take(iterations).enumerate() {
            if state.ctx.is_cancelled() {
                return LoopEnd::Stop(Control::Cancelled);
            }
            state.ctx.enter_iteration(&node.id, item, index);
            for id in &body {
                state.done.remove(id);
                state.activated.remove(id);
            }
            state.activated.extend(body_starts.iter().cloned());

            let control = self.run_nodes(state, body_order.clone()).await;
            let produced = state.ctx.exit_iteration();
            results.push(Value::Object(produced.into_iter().collect()));
            if control != Control::Continue {
                return LoopEnd::Stop(control);
            }
        }

        // Last-iteration body outputs become the run's outputs for those nodes.
        if let Some(Value::Object(last)) = results.last() {
            for id in state.ordered(&last.keys().cloned().collect()) {
                if state.ctx.node_outputs().contains(&id) {
                    continue;
                }
                let value = last[&id].clone();
                if let Err(e) = state.ctx.record_output(&id, value.clone()) {
                    return LoopEnd::Stop(Control::Abort(e.to_string()));
                }
                self.log_output(&exec, &id, &value).await;
            }
        }

        if !completed {
            warn!(execution_id = %exec, node_id = %node.id, limit, "Loop stopped at iteration limit");
        }
        LoopEnd::Finished(json!({
            "itemsCount": plan.get("items").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0),
            "iterations": results.len(),
            "completed": completed,
            "maxIterations": limit,
            "results": results,
        }))
    }
}

fn error_record(node: &Node, result: &NodeExecutionResult, handled_by: Option<String>) -> NodeErrorRecord {
    NodeErrorRecord {
        node_id: node.id.clone(),
        message: result.error_message().to_string(),
        code: result.error_code().to_string(),
        recoverable: result.is_recoverable,
        handled_by,
    }
}
