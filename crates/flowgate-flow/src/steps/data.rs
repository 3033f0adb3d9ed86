use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use flowgate_core::flow::{Node, StepKind};

use crate::result::{codes, NodeExecutionResult};
use crate::step::{require_str, StepExecutor, StepInput};

// ── SetVariableStep ─────────────────────────────────────────────

/// Produces `{name, value}`; the executor commits it to the run's variables.
pub struct SetVariableStep;

impl StepExecutor for SetVariableStep {
    fn kind(&self) -> StepKind {
        StepKind::SetVariable
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let mut errors = vec![];
        require_str(node, "name", &mut errors);
        errors
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let Some(name) = input.str("name").filter(|n| !n.trim().is_empty()) else {
                return NodeExecutionResult::failure("'name' is required", codes::VALIDATION);
            };
            let value = input.get("value").cloned().unwrap_or(Value::Null);
            NodeExecutionResult::success(json!({ "name": name.trim(), "value": value }))
        })
    }
}

// ── TransformStep ───────────────────────────────────────────────

/// Renders `template` (into `result`) or a `fields` object into data.
pub struct TransformStep;

impl StepExecutor for TransformStep {
    fn kind(&self) -> StepKind {
        StepKind::Transform
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let config = node.config();
        match (config.get("template"), config.get("fields")) {
            (None, None) => vec![format!(
                "node '{}': transform needs 'template' or 'fields'",
                node.id
            )],
            (_, Some(fields)) if !fields.is_object() => {
                vec![format!("node '{}': 'fields' must be an object", node.id)]
            }
            _ => vec![],
        }
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let parse_json = input
                .get("parseJson")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            if let Some(Value::Object(fields)) = input.get("fields") {
                return NodeExecutionResult::success(Value::Object(fields.clone()));
            }

            let rendered = input.get("template").cloned().unwrap_or(Value::Null);
            let result = match (&rendered, parse_json) {
                (Value::String(text), true) => match serde_json::from_str::<Value>(text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        return NodeExecutionResult::failure(
                            format!("template did not render valid JSON: {}", e),
                            codes::VALIDATION,
                        )
                    }
                },
                _ => rendered,
            };
            NodeExecutionResult::success(json!({ "result": result }))
        })
    }
}

// ── LogStep ─────────────────────────────────────────────────────

/// Emits a tracing event at the configured level.
pub struct LogStep;

impl StepExecutor for LogStep {
    fn kind(&self) -> StepKind {
        StepKind::Log
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let mut errors = vec![];
        require_str(node, "message", &mut errors);
        if let Some(level) = node.config().get("level").and_then(|v| v.as_str()) {
            if !matches!(level, "trace" | "debug" | "info" | "warn" | "error") {
                errors.push(format!("node '{}': unknown log level '{}'", node.id, level));
            }
        }
        errors
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let message = input.str("message").unwrap_or_default().to_string();
            let level = input.str("level").unwrap_or("info").to_string();
            let exec = &input.context.execution_id;
            let node_id = &input.node.id;

            match level.as_str() {
                "trace" => trace!(execution_id = %exec, node_id = %node_id, "{}", message),
                "debug" => debug!(execution_id = %exec, node_id = %node_id, "{}", message),
                "warn" => warn!(execution_id = %exec, node_id = %node_id, "{}", message),
                "error" => error!(execution_id = %exec, node_id = %node_id, "{}", message),
                _ => info!(execution_id = %exec, node_id = %node_id, "{}", message),
            }

            NodeExecutionResult::success(json!({ "message": message, "level": level }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::run_step;

    #[tokio::test]
    async fn test_set_variable_output() {
        let node = Node::new("set", StepKind::SetVariable)
            .with_config(json!({"name": "greeting", "value": {"text": "hi"}}));
        let result = run_step(&SetVariableStep, &node, json!({})).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap(), json!({"name": "greeting", "value": {"text": "hi"}}));
    }

    #[test]
    fn test_set_variable_requires_name() {
        let node = Node::new("set", StepKind::SetVariable).with_config(json!({"value": 1}));
        assert_eq!(SetVariableStep.validate(&node).len(), 1);
    }

    #[tokio::test]
    async fn test_transform_template_and_fields() {
        let node = Node::new("t", StepKind::Transform)
            .with_config(json!({"template": "Hello {{input.name}}"}));
        let result = run_step(&TransformStep, &node, json!({"name": "Ada"})).await;
        assert_eq!(result.data.unwrap()["result"], "Hello Ada");

        let node = Node::new("t", StepKind::Transform)
            .with_config(json!({"fields": {"who": "{{input.name}}", "n": "{{input.n}}"}}));
        let result = run_step(&TransformStep, &node, json!({"name": "Ada", "n": 2})).await;
        assert_eq!(result.data.unwrap(), json!({"who": "Ada", "n": 2}));
    }

    #[tokio::test]
    async fn test_transform_parse_json() {
        let node = Node::new("t", StepKind::Transform)
            .with_config(json!({"template": "{\"ok\": {{input.flag}}}", "parseJson": true}));
        let result = run_step(&TransformStep, &node, json!({"flag": true})).await;
        assert_eq!(result.data.unwrap()["result"]["ok"], true);

        let node = Node::new("t", StepKind::Transform)
            .with_config(json!({"template": "not json", "parseJson": true}));
        let result = run_step(&TransformStep, &node, json!({})).await;
        assert!(!result.success);
        assert!(!result.is_recoverable);
    }

    #[test]
    fn test_log_validation() {
        let node = Node::new("l", StepKind::Log).with_config(json!({"message": "x", "level": "loud"}));
        assert_eq!(LogStep.validate(&node).len(), 1);
    }
}
