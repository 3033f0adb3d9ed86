use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowgate_core::record::RunStatus;
use flowgate_core::types::{ProviderResult, TaskClassification, TaskTier, Usage};
use flowgate_flow::ExecutionOutcome;

use crate::swarm::DelegationReceipt;

/// The six dispatch tiers plus preprocessing, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineTier {
    Preprocess,
    HighPriorityFlow,
    Shortcut,
    StandardFlow,
    AiRouter,
    Swarm,
    Fallback,
}

impl PipelineTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::HighPriorityFlow => "high_priority_flow",
            Self::Shortcut => "shortcut",
            Self::StandardFlow => "standard_flow",
            Self::AiRouter => "ai_router",
            Self::Swarm => "swarm",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for PipelineTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineResultType {
    Skipped,
    Passive,
    FlowExecuted,
    Shortcut,
    AiRouted,
    Delegated,
    Fallback,
    NoMatch,
    Error,
}

/// One tier that was consulted, and what it decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub tier: PipelineTier,
    pub outcome: String,
}

/// Summary of one flow run made by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecution {
    pub flow_id: String,
    pub execution_id: String,
    pub status: RunStatus,
    pub success: bool,
    pub output: Value,
    /// Reply text taken from the run, if it produced any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&ExecutionOutcome> for FlowExecution {
    fn from(outcome: &ExecutionOutcome) -> Self {
        Self {
            flow_id: outcome.record.flow_id.clone(),
            execution_id: outcome.record.execution_id.clone(),
            status: outcome.status(),
            success: outcome.is_success(),
            output: outcome.record.output.clone(),
            response: response_text(outcome),
            error: outcome.record.error.clone(),
        }
    }
}

/// Run variable a flow sets to choose its reply explicitly.
pub const RESPONSE_VARIABLE: &str = "response";

/// A flow's reply: the `response` variable, else the latest node output
/// that carries text.
fn response_text(outcome: &ExecutionOutcome) -> Option<String> {
    if let Some(Value::String(s)) = outcome.variable(RESPONSE_VARIABLE) {
        return Some(s.clone());
    }
    outcome
        .executed
        .iter()
        .rev()
        .filter_map(|id| outcome.output(id))
        .find_map(output_text)
}

fn output_text(output: &Value) -> Option<String> {
    match output {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => ["response", "text", "message", "content", "result"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()).map(str::to_string)),
        _ => None,
    }
}

/// Which provider answered, without the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMeta {
    pub provider: String,
    pub model: String,
    pub tier: TaskTier,
    pub usage: Usage,
    pub attempts: usize,
}

impl From<&ProviderResult> for ProviderMeta {
    fn from(result: &ProviderResult) -> Self {
        Self {
            provider: result.provider.clone(),
            model: result.model.clone(),
            tier: result.tier,
            usage: result.usage,
            attempts: result.attempts.len(),
        }
    }
}

/// Typed outcome of one dispatch. Failures are reported here, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    #[serde(rename = "type")]
    pub result_type: PipelineResultType,
    /// Tier that produced the final answer.
    pub tier: Option<PipelineTier>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub flow_execution: Option<FlowExecution>,
    /// A passthrough flow that matched earlier in the same dispatch.
    #[serde(default)]
    pub prior_flow_execution: Option<FlowExecution>,
    #[serde(default)]
    pub delegation: Option<DelegationReceipt>,
    #[serde(default)]
    pub classification: Option<TaskClassification>,
    #[serde(default)]
    pub provider: Option<ProviderMeta>,
    #[serde(default)]
    pub error: Option<String>,
    pub trace: Vec<TraceEntry>,
}

impl PipelineResult {
    pub fn new(result_type: PipelineResultType, tier: Option<PipelineTier>) -> Self {
        Self {
            result_type,
            tier,
            response: None,
            flow_execution: None,
            prior_flow_execution: None,
            delegation: None,
            classification: None,
            provider: None,
            error: None,
            trace: vec![],
        }
    }

    pub fn error(tier: PipelineTier, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(PipelineResultType::Error, Some(tier))
        }
    }

    /// Whether `tier` was consulted during this dispatch.
    pub fn invoked(&self, tier: PipelineTier) -> bool {
        self.trace.iter().any(|t| t.tier == tier)
    }

    /// Tiers in the order they were consulted.
    pub fn tiers(&self) -> Vec<PipelineTier> {
        self.trace.iter().map(|t| t.tier).collect()
    }
}
