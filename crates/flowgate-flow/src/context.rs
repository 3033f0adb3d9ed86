use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::{ExecutionId, TriggerInfo};

/// Write-once map of node id to result payload, remembering insertion order.
#[derive(Debug, Clone, Default)]
pub struct NodeOutputs {
    values: BTreeMap<String, Value>,
    order: Vec<String>,
}

impl NodeOutputs {
    pub fn get(&self, node_id: &str) -> Option<&Value> {
        self.values.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.values.contains_key(node_id)
    }

    /// Record a node's output. Existing entries are never overwritten.
    pub fn insert(&mut self, node_id: &str, value: Value) -> Result<()> {
        if self.values.contains_key(node_id) {
            return Err(FlowgateError::NodeFailed {
                node_id: node_id.to_string(),
                message: "output already recorded for this run".into(),
            });
        }
        self.values.insert(node_id.to_string(), value);
        self.order.push(node_id.to_string());
        Ok(())
    }

    /// Output of the most recently completed node.
    pub fn last(&self) -> Option<&Value> {
        self.order.last().and_then(|id| self.values.get(id))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.values.clone()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect())
    }
}

/// Per-iteration overlay while a loop body runs.
#[derive(Debug, Clone, Default)]
struct IterationScope {
    loop_id: String,
    vars: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
    order: Vec<String>,
}

/// State owned by a single run.
///
/// Steps only ever see `&ExecutionContext`; the executor is the single writer
/// of `variables` (via set-variable steps) and `node_outputs`.
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub flow_id: String,
    pub input: Value,
    pub trigger: TriggerInfo,
    variables: HashMap<String, Value>,
    node_outputs: NodeOutputs,
    scope: Option<IterationScope>,
    cancel: CancellationToken,
    cache: Mutex<HashMap<String, String>>,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId, flow_id: impl Into<String>, input: Value) -> Self {
        Self {
            execution_id,
            flow_id: flow_id.into(),
            input,
            trigger: TriggerInfo::manual(),
            variables: HashMap::new(),
            node_outputs: NodeOutputs::default(),
            scope: None,
            cancel: CancellationToken::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerInfo) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seed a variable before the run starts.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Seed a node output (tests and replay).
    pub fn with_output(mut self, node_id: &str, value: Value) -> Self {
        let _ = self.node_outputs.insert(node_id, value);
        self
    }

    // ── Reads ──────────────────────────────────────────────────

    /// Look up a variable; loop scope (`currentItem`, `currentIndex`) shadows run variables.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.scope
            .as_ref()
            .and_then(|s| s.vars.get(name))
            .or_else(|| self.variables.get(name))
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Output of a node; inside a loop iteration the current iteration wins.
    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.scope
            .as_ref()
            .and_then(|s| s.outputs.get(node_id))
            .or_else(|| self.node_outputs.get(node_id))
    }

    /// Output of the most recently completed node.
    pub fn previous_output(&self) -> Option<&Value> {
        if let Some(scope) = &self.scope {
            if let Some(id) = scope.order.last() {
                return scope.outputs.get(id);
            }
        }
        self.node_outputs.last()
    }

    pub fn node_outputs(&self) -> &NodeOutputs {
        &self.node_outputs
    }

    pub fn in_iteration(&self) -> bool {
        self.scope.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ── Writes (executor only) ─────────────────────────────────

    pub(crate) fn set_variable(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.invalidate_cache();
        self.variables.insert(name.into(), value)
    }

    /// Record a node result. Inside a loop iteration it lands in the overlay.
    pub(crate) fn record_output(&mut self, node_id: &str, value: Value) -> Result<()> {
        self.invalidate_cache();
        match self.scope.as_mut() {
            Some(scope) => {
                scope.outputs.insert(node_id.to_string(), value);
                scope.order.push(node_id.to_string());
                Ok(())
            }
            None => self.node_outputs.insert(node_id, value),
        }
    }

    /// Begin one loop iteration, exposing `currentItem` and `currentIndex`.
    pub(crate) fn enter_iteration(&mut self, loop_id: &str, item: Value, index: usize) {
        let mut vars = HashMap::new();
        vars.insert("currentItem".to_string(), item.clone());
        vars.insert("currentIndex".to_string(), Value::from(index));
        let mut outputs = HashMap::new();
        outputs.insert(
            loop_id.to_string(),
            serde_json::json!({ "currentItem": item, "currentIndex": index }),
        );
        self.scope = Some(IterationScope {
            loop_id: loop_id.to_string(),
            vars,
            outputs,
            order: vec![],
        });
        self.invalidate_cache();
    }

    /// End the current iteration, returning the body outputs it produced.
    pub(crate) fn exit_iteration(&mut self) -> BTreeMap<String, Value> {
        self.invalidate_cache();
        match self.scope.take() {
            Some(mut scope) => {
                scope.outputs.remove(&scope.loop_id);
                scope.outputs.into_iter().collect()
            }
            None => BTreeMap::new(),
        }
    }

    // ── Resolver cache ─────────────────────────────────────────

    pub(crate) fn cached(&self, template: &str) -> Option<String> {
        self.cache.lock().ok()?.get(template).cloned()
    }

    pub(crate) fn cache_put(&self, template: &str, rendered: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(template.to_string(), rendered.to_string());
        }
    }

    pub(crate) fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("flow_id", &self.flow_id)
            .field("variables", &self.variables.len())
            .field("node_outputs", &self.node_outputs.len())
            .field("in_iteration", &self.scope.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
