use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flowgate_core::flow::StepKind;
use flowgate_core::traits::{AiTaskRunner, MessageSender};

use crate::step::StepExecutor;
use crate::steps::*;

/// Collaborators the built-in steps need.
#[derive(Clone)]
pub struct StepDeps {
    pub http: reqwest::Client,
    pub sender: Option<Arc<dyn MessageSender>>,
    pub ai: Option<Arc<dyn AiTaskRunner>>,
    pub max_delay: Duration,
}

impl Default for StepDeps {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            sender: None,
            ai: None,
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// Step executors by kind. Built once at startup, read-only afterwards.
pub struct StepRegistry {
    steps: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Register an executor, replacing any existing one for its kind.
    pub fn register(&mut self, step: impl StepExecutor) {
        self.steps.insert(step.kind(), Arc::new(step));
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.steps.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.steps.contains_key(&kind)
    }

    /// Registered kinds in catalog order.
    pub fn kinds(&self) -> Vec<StepKind> {
        StepKind::ALL
            .iter()
            .copied()
            .filter(|k| self.steps.contains_key(k))
            .collect()
    }

    /// Create a registry with every built-in step registered.
    pub fn with_builtins(deps: StepDeps) -> Self {
        let mut registry = Self::new();

        // ── Triggers ────────────────────────────────────────────
        registry.register(TriggerStep::new(StepKind::ManualTrigger));
        registry.register(TriggerStep::new(StepKind::MessageTrigger));
        registry.register(TriggerStep::new(StepKind::WebhookTrigger));
        registry.register(TriggerStep::new(StepKind::ScheduleTrigger));

        // ── Actions ─────────────────────────────────────────────
        registry.register(SetVariableStep);
        registry.register(TransformStep);
        registry.register(LogStep);
        registry.register(HttpRequestStep::new(deps.http));
        registry.register(SendMessageStep::new(deps.sender));
        registry.register(AiTaskStep::new(deps.ai));

        // ── Logic ───────────────────────────────────────────────
        registry.register(ConditionStep);
        registry.register(SwitchStep);
        registry.register(LoopStep);
        registry.register(DelayStep::new(deps.max_delay));
        registry.register(ErrorHandlerStep);

        registry
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_cover_catalog() {
        let registry = StepRegistry::with_builtins(StepDeps::default());
        assert_eq!(registry.kinds(), StepKind::ALL.to_vec());
        for kind in StepKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = StepRegistry::new();
        assert!(!registry.contains(StepKind::Log));
        registry.register(LogStep);
        registry.register(LogStep);
        assert_eq!(registry.kinds(), vec![StepKind::Log]);
    }
}
