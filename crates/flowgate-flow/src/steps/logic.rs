//! Control-flow steps. They report a branch or a plan; the executor acts on it.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowgate_core::config::LOOP_ITERATION_CEILING;
use flowgate_core::flow::{ConfigMap, Node, StepKind};

use crate::condition::{evaluate_config, loosely_equal, validate_config};
use crate::result::{codes, NodeExecutionResult};
use crate::step::{config_u64, StepExecutor, StepInput};

pub const DEFAULT_BRANCH: &str = "default";
pub const BODY_BRANCH: &str = "body";
pub const DONE_BRANCH: &str = "done";

// ── ConditionStep ───────────────────────────────────────────────

pub struct ConditionStep;

impl StepExecutor for ConditionStep {
    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        validate_config(node.config())
            .into_iter()
            .map(|e| format!("node '{}': {}", node.id, e))
            .collect()
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            match evaluate_config(&input.config) {
                Ok(result) => NodeExecutionResult::success(json!({
                    "result": result,
                    "branch": if result { "true" } else { "false" },
                })),
                Err(e) => NodeExecutionResult::failure(e, codes::VALIDATION),
            }
        })
    }
}

// ── SwitchStep ──────────────────────────────────────────────────

/// Selects the first case whose value equals `value`; `default` otherwise.
///
/// `cases` is either `{branch: matchValue}` or `[{value, branch}]`.
pub struct SwitchStep;

fn switch_cases(cases: Option<&Value>) -> Vec<(String, Value)> {
    match cases {
        Some(Value::Object(map)) => map.iter().map(|(b, v)| (b.clone(), v.clone())).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let branch = item
                    .get("branch")
                    .or_else(|| item.get("output"))
                    .and_then(|b| b.as_str())?;
                Some((branch.to_string(), item.get("value").cloned().unwrap_or(Value::Null)))
            })
            .collect(),
        _ => vec![],
    }
}

impl StepExecutor for SwitchStep {
    fn kind(&self) -> StepKind {
        StepKind::Switch
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let config = node.config();
        let mut errors = vec![];
        if !config.contains_key("value") {
            errors.push(format!("node '{}': 'value' is required", node.id));
        }
        match config.get("cases") {
            Some(Value::Object(_)) => {}
            Some(Value::Array(items)) => {
                if switch_cases(config.get("cases")).len() != items.len() {
                    errors.push(format!("node '{}': every case needs a 'branch'", node.id));
                }
            }
            _ => errors.push(format!("node '{}': 'cases' must be an object or list", node.id)),
        }
        errors
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let value = input.get("value").cloned().unwrap_or(Value::Null);
            let matched = switch_cases(input.get("cases"))
                .into_iter()
                .find(|(_, case)| loosely_equal(&value, case))
                .map(|(branch, _)| branch);
            NodeExecutionResult::success(json!({
                "value": value,
                "matched": matched.is_some(),
                "branch": matched.as_deref().unwrap_or(DEFAULT_BRANCH),
            }))
        })
    }
}

// ── LoopStep ────────────────────────────────────────────────────

/// Resolves the item list; the executor runs the body once per item.
pub struct LoopStep;

/// Items arrive as an array, or as a string holding a JSON array.
fn loop_items(config: &ConfigMap) -> Result<Vec<Value>, String> {
    match config.get("items") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(format!("'items' did not resolve to a list: {}", s)),
        },
        Some(Value::Null) | None => Err("'items' is required".into()),
        Some(other) => Err(format!("'items' must be a list, got {}", other)),
    }
}

impl StepExecutor for LoopStep {
    fn kind(&self) -> StepKind {
        StepKind::Loop
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let config = node.config();
        let mut errors = vec![];
        if !config.contains_key("items") {
            errors.push(format!("node '{}': 'items' is required", node.id));
        }
        if let Some(raw) = config.get("maxIterations") {
            match config_u64(config, "maxIterations") {
                Some(n) if n as usize > LOOP_ITERATION_CEILING => errors.push(format!(
                    "node '{}': maxIterations {} exceeds the ceiling of {}",
                    node.id, n, LOOP_ITERATION_CEILING
                )),
                Some(_) => {}
                None if raw.as_str().is_some_and(|s| s.contains("{{")) => {}
                None => errors.push(format!(
                    "node '{}': maxIterations must be a non-negative integer",
                    node.id
                )),
            }
        }
        errors
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let items = match loop_items(&input.config) {
                Ok(items) => items,
                Err(e) => return NodeExecutionResult::failure(e, codes::VALIDATION),
            };
            let max = config_u64(&input.config, "maxIterations");
            if max.is_some_and(|n| n as usize > LOOP_ITERATION_CEILING) {
                return NodeExecutionResult::failure(
                    format!("maxIterations exceeds the ceiling of {}", LOOP_ITERATION_CEILING),
                    codes::LOOP_LIMIT,
                );
            }
            NodeExecutionResult::success(json!({
                "items": items,
                "maxIterations": max,
            }))
        })
    }
}

// ── DelayStep ───────────────────────────────────────────────────

/// Suspends the run without blocking a thread. Wakes early on cancellation.
pub struct DelayStep {
    max_delay: Duration,
}

impl DelayStep {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    fn duration(&self, config: &ConfigMap) -> Option<Duration> {
        let requested = if let Some(ms) = config_u64(config, "durationMs") {
            Duration::from_millis(ms)
        } else {
            let secs = match config.get("seconds")? {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            if secs.is_nan() || secs < 0.0 {
                return None;
            }
            // Clamp before converting; huge values overflow `Duration`.
            if secs >= self.max_delay.as_secs_f64() {
                return Some(self.max_delay);
            }
            Duration::from_secs_f64(secs)
        };
        Some(requested.min(self.max_delay))
    }
}

impl StepExecutor for DelayStep {
    fn kind(&self) -> StepKind {
        StepKind::Delay
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let config = node.config();
        if config.contains_key("durationMs") || config.contains_key("seconds") {
            vec![]
        } else {
            vec![format!("node '{}': delay needs 'durationMs' or 'seconds'", node.id)]
        }
    }

    fn timeout_hint(&self, config: &ConfigMap) -> Option<Duration> {
        self.duration(config).map(|d| d + Duration::from_secs(1))
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let Some(duration) = self.duration(&input.config) else {
                return NodeExecutionResult::failure("invalid delay duration", codes::VALIDATION);
            };
            let cancel = input.context.cancellation_token();
            let start = Instant::now();
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(duration) => false,
                _ = cancel.cancelled() => true,
            };
            NodeExecutionResult::success(json!({
                "requestedMs": duration.as_millis() as u64,
                "delayedMs": start.elapsed().as_millis() as u64,
                "interrupted": interrupted,
            }))
        })
    }
}

// ── ErrorHandlerStep ────────────────────────────────────────────

/// Retry policy of an error-handler node.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConfigMap, default_backoff: Duration, max_backoff: Duration) -> Self {
        let multiplier = config
            .get("backoffMultiplier")
            .and_then(|v| v.as_f64())
            .filter(|m| m.is_finite() && *m >= 1.0)
            .unwrap_or(2.0);
        Self {
            max_retries: config_u64(config, "maxRetries").unwrap_or(0).min(u32::MAX as u64) as u32,
            backoff: config_u64(config, "backoffMs")
                .map(Duration::from_millis)
                .unwrap_or(default_backoff),
            multiplier,
            max_backoff: config_u64(config, "maxBackoffMs")
                .map(Duration::from_millis)
                .unwrap_or(max_backoff),
        }
    }

    /// Exponential backoff before retry `attempt` (1-based), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.backoff.as_millis() as f64 * factor).min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Runs only through the failure path, after the error lands in `var.error`.
pub struct ErrorHandlerStep;

impl StepExecutor for ErrorHandlerStep {
    fn kind(&self) -> StepKind {
        StepKind::ErrorHandler
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let config = node.config();
        ["maxRetries", "backoffMs", "maxBackoffMs"]
            .iter()
            .filter(|k| config.contains_key(**k) && config_u64(config, k).is_none())
            .map(|k| format!("node '{}': '{}' must be a non-negative integer", node.id, k))
            .collect()
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let error = input.context.variable("error").cloned().unwrap_or(Value::Null);
            NodeExecutionResult::success(json!({ "handled": true, "error": error }))
        })
    }
}
