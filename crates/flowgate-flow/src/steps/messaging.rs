use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, warn};

use flowgate_core::error::FlowgateError;
use flowgate_core::flow::{Node, StepKind};
use flowgate_core::traits::{AiTaskRunner, MessageSender};
use flowgate_core::types::{ChatMessage, ProviderRequest};

use crate::result::{codes, NodeExecutionResult};
use crate::step::{require_str, StepExecutor, StepInput};

// ── SendMessageStep ─────────────────────────────────────────────

/// Sends text through the messaging collaborator.
///
/// `channel` and `recipient` default to the trigger's channel and sender, so a
/// message-triggered flow replies in place.
pub struct SendMessageStep {
    sender: Option<Arc<dyn MessageSender>>,
}

impl SendMessageStep {
    pub fn new(sender: Option<Arc<dyn MessageSender>>) -> Self {
        Self { sender }
    }
}

impl StepExecutor for SendMessageStep {
    fn kind(&self) -> StepKind {
        StepKind::SendMessage
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let mut errors = vec![];
        require_str(node, "text", &mut errors);
        errors
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let Some(sender) = self.sender.as_ref() else {
                return NodeExecutionResult::failure(
                    "no message sender configured",
                    codes::NOT_CONFIGURED,
                );
            };
            let trigger = &input.context.trigger;
            let channel = input
                .str("channel")
                .map(str::to_string)
                .or_else(|| trigger.channel.clone());
            let recipient = input
                .str("recipient")
                .map(str::to_string)
                .or_else(|| trigger.sender.clone());
            let (Some(channel), Some(recipient)) = (channel, recipient) else {
                return NodeExecutionResult::failure(
                    "channel and recipient are required when the trigger has none",
                    codes::VALIDATION,
                );
            };
            let text = input.str("text").unwrap_or_default();

            match sender.send(&channel, &recipient, text).await {
                Ok(message_id) => {
                    debug!(node_id = %input.node.id, channel = %channel, "Message sent");
                    NodeExecutionResult::success(json!({
                        "messageId": message_id,
                        "channel": channel,
                        "recipient": recipient,
                    }))
                }
                Err(e) => {
                    warn!(node_id = %input.node.id, channel = %channel, error = %e, "Send failed");
                    NodeExecutionResult::recoverable_failure(e.to_string(), codes::SEND_FAILED)
                }
            }
        })
    }
}

// ── AiTaskStep ──────────────────────────────────────────────────

/// Runs a prompt through the task router (classification plus failover).
pub struct AiTaskStep {
    runner: Option<Arc<dyn AiTaskRunner>>,
}

impl AiTaskStep {
    pub fn new(runner: Option<Arc<dyn AiTaskRunner>>) -> Self {
        Self { runner }
    }
}

impl StepExecutor for AiTaskStep {
    fn kind(&self) -> StepKind {
        StepKind::AiTask
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let mut errors = vec![];
        require_str(node, "prompt", &mut errors);
        if let Some(tier) = node.config().get("forceTier").and_then(|v| v.as_str()) {
            if let Err(e) = tier.parse::<flowgate_core::types::TaskTier>() {
                errors.push(format!("node '{}': {}", node.id, e));
            }
        }
        errors
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let Some(runner) = self.runner.as_ref() else {
                return NodeExecutionResult::failure("no AI task runner configured", codes::NOT_CONFIGURED);
            };
            let ctx = input.context;
            let prompt = input.str("prompt").unwrap_or_default().to_string();
            let user_id = input
                .str("userId")
                .map(str::to_string)
                .or_else(|| ctx.trigger.sender.clone())
                .unwrap_or_else(|| format!("flow:{}", ctx.flow_id));

            let mut messages = vec![];
            if let Some(system) = input.str("system") {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt.clone()));

            let request = ProviderRequest {
                task: Some(prompt),
                messages,
                user_id,
                force_tier: input.str("forceTier").and_then(|t| t.parse().ok()),
                force_provider: input.str("forceProvider").map(str::to_string),
            };

            match runner.run_task(request).await {
                Ok(result) => NodeExecutionResult::success(json!({
                    "content": result.content,
                    "provider": result.provider,
                    "model": result.model,
                    "tier": result.tier,
                    "usage": result.usage,
                    "attempts": result.attempts.len(),
                })),
                Err(e @ FlowgateError::ChainExhausted { .. }) => {
                    NodeExecutionResult::failure(e.to_string(), codes::CHAIN_EXHAUSTED)
                }
                Err(e) if e.is_recoverable() => {
                    NodeExecutionResult::recoverable_failure(e.to_string(), codes::PROVIDER_ERROR)
                }
                Err(e) => NodeExecutionResult::failure(e.to_string(), codes::PROVIDER_ERROR),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::{run_step, run_step_with};
    use flowgate_core::error::Result;
    use flowgate_core::types::{ProviderResult, TaskTier, TriggerInfo, Usage};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(String, String, String)>>);

    impl MessageSender for Outbox {
        fn send<'a>(
            &'a self,
            channel: &'a str,
            recipient: &'a str,
            text: &'a str,
        ) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                self.0
                    .lock()
                    .unwrap()
                    .push((channel.into(), recipient.into(), text.into()));
                Ok("m-1".to_string())
            })
        }
    }

    struct Exhausted;

    impl AiTaskRunner for Exhausted {
        fn run_task(&self, _request: ProviderRequest) -> BoxFuture<'_, Result<ProviderResult>> {
            Box::pin(async {
                Err(FlowgateError::ChainExhausted {
                    attempts: vec!["a/m: rate limited".into()],
                })
            })
        }
    }

    struct Echo;

    impl AiTaskRunner for Echo {
        fn run_task(&self, request: ProviderRequest) -> BoxFuture<'_, Result<ProviderResult>> {
            Box::pin(async move {
                Ok(ProviderResult {
                    content: format!("echo: {}", request.description()),
                    model: "m".into(),
                    provider: "p".into(),
                    tier: request.force_tier.unwrap_or(TaskTier::Simple),
                    usage: Usage::default(),
                    attempts: vec![],
                })
            })
        }
    }

    #[tokio::test]
    async fn test_send_defaults_to_trigger_sender() {
        let outbox = Arc::new(Outbox::default());
        let step = SendMessageStep::new(Some(outbox.clone()));
        let node = Node::new("reply", StepKind::SendMessage)
            .with_config(json!({"text": "ack: {{input.text}}"}));
        let trigger = TriggerInfo {
            source: "message".into(),
            channel: Some("slack".into()),
            sender: Some("U42".into()),
            ..Default::default()
        };
        let result = run_step_with(&step, &node, json!({"text": "disk full"}), trigger).await;
        assert!(result.success);
        let sent = outbox.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "slack");
        assert_eq!(sent[0].1, "U42");
        assert_eq!(sent[0].2, "ack: disk full");
    }

    #[tokio::test]
    async fn test_send_without_sender_is_fatal() {
        let node = Node::new("reply", StepKind::SendMessage).with_config(json!({"text": "x"}));
        let result = run_step(&SendMessageStep::new(None), &node, json!({})).await;
        assert!(!result.success);
        assert!(!result.is_recoverable);
        assert_eq!(result.error_code(), codes::NOT_CONFIGURED);
    }

    #[tokio::test]
    async fn test_ai_task_success_and_forced_tier() {
        let step = AiTaskStep::new(Some(Arc::new(Echo)));
        let node = Node::new("ai", StepKind::AiTask)
            .with_config(json!({"prompt": "summarize {{input.text}}", "forceTier": "complex"}));
        let result = run_step(&step, &node, json!({"text": "logs"})).await;
        let data = result.data.unwrap();
        assert_eq!(data["content"], "echo: summarize logs");
        assert_eq!(data["tier"], "complex");
    }

    #[tokio::test]
    async fn test_chain_exhaustion_is_fatal() {
        let step = AiTaskStep::new(Some(Arc::new(Exhausted)));
        let node = Node::new("ai", StepKind::AiTask).with_config(json!({"prompt": "hi"}));
        let result = run_step(&step, &node, json!({})).await;
        assert!(!result.success);
        assert!(!result.is_recoverable);
        assert_eq!(result.error_code(), codes::CHAIN_EXHAUSTED);
    }

    #[test]
    fn test_ai_task_validation() {
        let step = AiTaskStep::new(None);
        let node = Node::new("ai", StepKind::AiTask).with_config(json!({"forceTier": "galactic"}));
        assert_eq!(step.validate(&node).len(), 2);
    }
}
