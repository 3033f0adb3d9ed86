use futures::future::BoxFuture;
use serde_json::json;

use flowgate_core::flow::StepKind;

use crate::result::NodeExecutionResult;
use crate::step::{StepExecutor, StepInput};

/// Entry node of a flow. Echoes the run input and its provenance.
pub struct TriggerStep {
    kind: StepKind,
}

impl TriggerStep {
    pub fn new(kind: StepKind) -> Self {
        debug_assert!(kind.is_trigger());
        Self { kind }
    }
}

impl StepExecutor for TriggerStep {
    fn kind(&self) -> StepKind {
        self.kind
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let ctx = input.context;
            NodeExecutionResult::success(json!({
                "input": ctx.input,
                "trigger": ctx.trigger.to_value(),
                "executionId": ctx.execution_id.to_string(),
            }))
        })
    }
}
