use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use flowgate_core::flow::{ConfigMap, Node, StepKind};

use crate::context::ExecutionContext;
use crate::result::NodeExecutionResult;

/// What a step sees when it runs.
pub struct StepInput<'a> {
    pub node: &'a Node,
    /// The node's config with every template already resolved.
    pub config: ConfigMap,
    pub context: &'a ExecutionContext,
}

impl<'a> StepInput<'a> {
    pub fn str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        config_u64(&self.config, key)
    }
}

/// Read a non-negative integer that may also arrive as a numeric string.
pub fn config_u64(config: &ConfigMap, key: &str) -> Option<u64> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A unit of work bound to one `StepKind`.
pub trait StepExecutor: Send + Sync + 'static {
    fn kind(&self) -> StepKind;

    /// Structural checks before any node runs. Must not perform I/O.
    fn validate(&self, _node: &Node) -> Vec<String> {
        vec![]
    }

    /// Run the step. Failures are reported in the result, never as panics.
    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult>;

    /// Override of the executor's per-node timeout, derived from resolved config.
    fn timeout_hint(&self, _config: &ConfigMap) -> Option<Duration> {
        None
    }
}

/// Helper for `validate`: require a non-empty string config key.
pub fn require_str(node: &Node, key: &str, errors: &mut Vec<String>) {
    match node.config().get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::String(_)) | None => {
            errors.push(format!("node '{}': '{}' is required", node.id, key))
        }
        Some(_) => errors.push(format!("node '{}': '{}' must be a string", node.id, key)),
    }
}
