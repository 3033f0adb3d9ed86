pub mod data;
pub mod http;
pub mod logic;
pub mod messaging;
pub mod trigger;

pub use data::{LogStep, SetVariableStep, TransformStep};
pub use http::HttpRequestStep;
pub use logic::{ConditionStep, DelayStep, ErrorHandlerStep, LoopStep, RetryPolicy, SwitchStep};
pub use messaging::{AiTaskStep, SendMessageStep};
pub use trigger::TriggerStep;

#[cfg(test)]
pub(crate) mod test_support {
    use flowgate_core::flow::Node;
    use flowgate_core::types::{ExecutionId, TriggerInfo};
    use serde_json::Value;

    use crate::context::ExecutionContext;
    use crate::resolver::VariableResolver;
    use crate::result::NodeExecutionResult;
    use crate::step::{StepExecutor, StepInput};

    pub async fn run_step(step: &dyn StepExecutor, node: &Node, input: Value) -> NodeExecutionResult {
        run_step_with(step, node, input, TriggerInfo::manual()).await
    }

    /// Resolve the node's config against a fresh context and execute it.
    pub async fn run_step_with(
        step: &dyn StepExecutor,
        node: &Node,
        input: Value,
        trigger: TriggerInfo,
    ) -> NodeExecutionResult {
        let ctx = ExecutionContext::new(ExecutionId::from_str("test"), "flow", input)
            .with_trigger(trigger);
        let config = VariableResolver::default().resolve_config(node.config(), &ctx);
        step.execute(StepInput {
            node,
            config,
            context: &ctx,
        })
        .await
    }
}
