use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use flowgate_core::config::{PipelineConfig, PreprocessConfig, RoutingMode};
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::flow::{ExecutionStrategy, Flow, MAX_PRIORITY};
use flowgate_core::traits::PassiveIngest;
use flowgate_core::types::{InboundMessage, ProviderRequest, TriggerInfo};
use flowgate_flow::{ExecutionOutcome, FlowExecutor, RunOptions};
use flowgate_router::TaskRouter;

use crate::intent::IntentRouter;
use crate::preprocess::{Disposition, Preprocessor};
use crate::result::{
    FlowExecution, PipelineResult, PipelineResultType, PipelineTier, ProviderMeta, TraceEntry,
};
use crate::shortcuts::ShortcutTable;
use crate::swarm::{Delegator, PersonaRegistry};
use crate::trigger::FlowCatalog;
use crate::trigger_auth;

/// Variable a `conditional` flow sets to let the pipeline continue.
pub const CONTINUE_VARIABLE: &str = "continue_pipeline";

/// The tiered dispatcher. Built once at startup and shared across messages.
pub struct DispatchPipeline {
    executor: Arc<FlowExecutor>,
    config: PipelineConfig,
    preprocessor: Preprocessor,
    shortcuts: ShortcutTable,
    flows: FlowCatalog,
    intents: IntentRouter,
    personas: PersonaRegistry,
    delegator: Option<Arc<dyn Delegator>>,
    router: Option<Arc<TaskRouter>>,
    ingest: Option<Arc<dyn PassiveIngest>>,
}

/// State carried across tiers within one dispatch.
struct Dispatch {
    trace: Vec<TraceEntry>,
    /// Most recent passthrough flow, with the tier it ran in.
    prior: Option<(PipelineTier, FlowExecution)>,
}

impl Dispatch {
    fn note(&mut self, tier: PipelineTier, outcome: impl Into<String>) {
        let outcome = outcome.into();
        debug!(tier = %tier, outcome = %outcome, "Pipeline tier");
        self.trace.push(TraceEntry { tier, outcome });
    }

    fn finish(self, mut result: PipelineResult) -> PipelineResult {
        if result.prior_flow_execution.is_none() {
            result.prior_flow_execution = self.prior.map(|(_, exec)| exec);
        }
        result.trace = self.trace;
        result
    }
}

/// What a flow tier decided.
enum FlowTierOutcome {
    NoMatch,
    /// A flow ran and the pipeline stops here.
    Stopped(PipelineResult),
    /// A flow ran and asked the pipeline to keep going.
    Passthrough,
}

impl DispatchPipeline {
    pub fn new(executor: Arc<FlowExecutor>, config: PipelineConfig) -> Self {
        let shortcuts = ShortcutTable::new(&config.shortcuts);
        Self {
            executor,
            config,
            preprocessor: Preprocessor::default(),
            shortcuts,
            flows: FlowCatalog::new(),
            intents: IntentRouter::new(),
            personas: PersonaRegistry::new(),
            delegator: None,
            router: None,
            ingest: None,
        }
    }

    pub fn with_preprocess(mut self, config: PreprocessConfig) -> Result<Self> {
        self.preprocessor = Preprocessor::new(config)?;
        Ok(self)
    }

    pub fn with_flows(mut self, flows: FlowCatalog) -> Self {
        self.flows = flows;
        self
    }

    pub fn with_intents(mut self, intents: IntentRouter) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_personas(mut self, personas: PersonaRegistry) -> Self {
        self.personas = personas;
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn Delegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    /// Enables the fallback tier.
    pub fn with_router(mut self, router: Arc<TaskRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_ingest(mut self, ingest: Arc<dyn PassiveIngest>) -> Self {
        self.ingest = Some(ingest);
        self
    }

    pub fn flows(&self) -> &FlowCatalog {
        &self.flows
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Dispatch with the configured routing mode.
    pub async fn dispatch(&self, message: InboundMessage) -> PipelineResult {
        self.dispatch_with_mode(message, self.config.mode).await
    }

    /// Dispatch with a per-caller routing mode. Never fails: errors come back
    /// as `PipelineResultType::Error`.
    pub async fn dispatch_with_mode(&self, message: InboundMessage, mode: RoutingMode) -> PipelineResult {
        let mut state = Dispatch {
            trace: vec![],
            prior: None,
        };

        // ── Tier 0: preprocessing ───────────────────────────────
        match self.preprocessor.classify(&message) {
            Disposition::Skip(reason) => {
                state.note(PipelineTier::Preprocess, format!("skip: {}", reason));
                return state.finish(PipelineResult::new(
                    PipelineResultType::Skipped,
                    Some(PipelineTier::Preprocess),
                ));
            }
            Disposition::Passive(reason) => {
                state.note(PipelineTier::Preprocess, format!("passive: {}", reason));
                self.spawn_ingest(message);
                return state.finish(PipelineResult::new(
                    PipelineResultType::Passive,
                    Some(PipelineTier::Preprocess),
                ));
            }
            Disposition::Active => state.note(PipelineTier::Preprocess, "active"),
        }

        // ── Tier 1: high-priority flows ─────────────────────────
        let high = self.config.high_priority_min.min(MAX_PRIORITY);
        if let FlowTierOutcome::Stopped(result) = self
            .flow_tier(&mut state, &message, PipelineTier::HighPriorityFlow, high..=MAX_PRIORITY)
            .await
        {
            return state.finish(result);
        }

        // ── Tier 2: shortcuts ───────────────────────────────────
        if let Some((command, response)) = self.shortcuts.lookup(&message.text) {
            state.note(PipelineTier::Shortcut, format!("matched {}", command));
            let mut result = PipelineResult::new(PipelineResultType::Shortcut, Some(PipelineTier::Shortcut));
            result.response = Some(response);
            return state.finish(result);
        }
        state.note(PipelineTier::Shortcut, "no match");

        // ── Tiers 3 and 4: standard flows and the AI router ─────
        // An empty range when every priority counts as high.
        let standard = if high == 0 { 1..=0 } else { 0..=high - 1 };
        if mode == RoutingMode::AiFirst {
            if let Some(result) = self.ai_tier(&mut state, &message).await {
                return state.finish(result);
            }
            if let FlowTierOutcome::Stopped(result) = self
                .flow_tier(&mut state, &message, PipelineTier::StandardFlow, standard)
                .await
            {
                return state.finish(result);
            }
        } else {
            match self
                .flow_tier(&mut state, &message, PipelineTier::StandardFlow, standard)
                .await
            {
                FlowTierOutcome::Stopped(result) => return state.finish(result),
                FlowTierOutcome::Passthrough if mode == RoutingMode::FlowFirst => {}
                _ => {
                    if let Some(result) = self.ai_tier(&mut state, &message).await {
                        return state.finish(result);
                    }
                }
            }
        }

        // ── Tier 5: swarm delegation ────────────────────────────
        if let Some(result) = self.swarm_tier(&mut state, &message).await {
            return state.finish(result);
        }

        // ── Tier 6: fallback ────────────────────────────────────
        if let Some(result) = self.fallback_tier(&mut state, &message).await {
            return state.finish(result);
        }

        // Nothing later answered; a passthrough flow is the result.
        if let Some((tier, exec)) = state.prior.take() {
            let mut result = PipelineResult::new(PipelineResultType::FlowExecuted, Some(tier));
            result.response = exec.response.clone();
            result.flow_execution = Some(exec);
            return state.finish(result);
        }
        state.finish(PipelineResult::new(PipelineResultType::NoMatch, None))
    }

    async fn flow_tier(
        &self,
        state: &mut Dispatch,
        message: &InboundMessage,
        tier: PipelineTier,
        range: std::ops::RangeInclusive<u8>,
    ) -> FlowTierOutcome {
        let Some(flow) = self.flows.first_match(message, range) else {
            state.note(tier, "no match");
            return FlowTierOutcome::NoMatch;
        };

        let opts = RunOptions::new(message_input(message)).with_trigger(TriggerInfo::from_message(message));
        let outcome = match self.executor.execute(&flow, opts).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "Matched flow could not run");
                state.note(tier, format!("{} rejected: {}", flow.id, e));
                return FlowTierOutcome::NoMatch;
            }
        };
        let exec = FlowExecution::from(&outcome);

        if continues_pipeline(&flow, &outcome) {
            info!(flow_id = %flow.id, tier = %tier, "Flow matched, passing through");
            state.note(tier, format!("{} ran ({}), passthrough", flow.id, exec.status.as_str()));
            state.prior = Some((tier, exec));
            return FlowTierOutcome::Passthrough;
        }

        info!(flow_id = %flow.id, tier = %tier, status = exec.status.as_str(), "Flow matched");
        state.note(tier, format!("{} ran ({})", flow.id, exec.status.as_str()));
        let mut result = PipelineResult::new(PipelineResultType::FlowExecuted, Some(tier));
        result.response = exec.response.clone();
        result.flow_execution = Some(exec);
        FlowTierOutcome::Stopped(result)
    }

    async fn ai_tier(&self, state: &mut Dispatch, message: &InboundMessage) -> Option<PipelineResult> {
        if self.intents.is_empty() {
            return None;
        }
        let tier = PipelineTier::AiRouter;
        match self.intents.route(message).await {
            None => {
                state.note(tier, "no intent matched");
                None
            }
            Some(Ok((found, reply))) => {
                state.note(tier, format!("intent {} (score {})", found.intent, found.score));
                let mut result = PipelineResult::new(PipelineResultType::AiRouted, Some(tier));
                result.response = Some(reply.response);
                result.provider = reply.provider.as_ref().map(ProviderMeta::from);
                Some(result)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Intent tool failed");
                state.note(tier, format!("error: {}", e));
                Some(PipelineResult::error(tier, e.to_string()))
            }
        }
    }

    async fn swarm_tier(&self, state: &mut Dispatch, message: &InboundMessage) -> Option<PipelineResult> {
        let delegator = self.delegator.as_ref()?;
        if self.personas.is_empty() {
            return None;
        }
        let tier = PipelineTier::Swarm;
        let Some((persona, score)) = self
            .personas
            .best_match(&message.text, self.config.min_persona_score)
        else {
            state.note(tier, "no persona matched");
            return None;
        };

        match delegator.delegate(persona, score, message).await {
            Ok(receipt) => {
                state.note(tier, format!("delegated to {}", persona.id));
                let mut result = PipelineResult::new(PipelineResultType::Delegated, Some(tier));
                result.delegation = Some(receipt);
                Some(result)
            }
            Err(e) => {
                warn!(persona = %persona.id, error = %e, "Delegation failed");
                state.note(tier, format!("error: {}", e));
                None
            }
        }
    }

    async fn fallback_tier(&self, state: &mut Dispatch, message: &InboundMessage) -> Option<PipelineResult> {
        let router = self.router.as_ref()?;
        let tier = PipelineTier::Fallback;
        let request = ProviderRequest::task(message.user_id.clone(), message.text.clone());

        match router.route(&request).await {
            Ok((classification, provided)) => {
                state.note(tier, format!("{} via {}/{}", classification.tier, provided.provider, provided.model));
                let mut result = PipelineResult::new(PipelineResultType::Fallback, Some(tier));
                result.provider = Some(ProviderMeta::from(&provided));
                result.response = Some(provided.content);
                result.classification = Some(classification);
                Some(result)
            }
            Err(e) => {
                warn!(error = %e, "Fallback routing failed");
                state.note(tier, format!("error: {}", e));
                let mut result = PipelineResult::error(tier, e.to_string());
                result.classification = Some(router.classify(&request));
                Some(result)
            }
        }
    }

    fn spawn_ingest(&self, message: InboundMessage) {
        let Some(ingest) = self.ingest.clone() else {
            debug!(message_id = %message.id, "Passive message dropped, no ingest configured");
            return;
        };
        tokio::spawn(async move {
            let id = message.id.clone();
            if let Err(e) = ingest.ingest(message).await {
                warn!(message_id = %id, error = %e, "Passive ingest failed");
            }
        });
    }

    /// Run a flow from an external webhook. Auth is checked before any run is
    /// created.
    pub async fn trigger_webhook(
        &self,
        flow_id: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<FlowExecution> {
        let entry = self
            .flows
            .get(flow_id)
            .filter(|e| e.flow.enabled && e.accepts_webhooks())
            .ok_or_else(|| FlowgateError::FlowNotFound(flow_id.to_string()))?;

        if let Err(e) = trigger_auth::verify(&entry.flow.trigger.auth, headers, body) {
            warn!(flow_id, error = %e, "Webhook rejected");
            return Err(e);
        }

        let input = serde_json::from_slice::<Value>(body)
            .unwrap_or_else(|_| json!({"raw": String::from_utf8_lossy(body)}));
        let opts = RunOptions::new(input).with_trigger(TriggerInfo::webhook(flow_id));
        let outcome = self.executor.execute(&entry.flow, opts).await?;
        info!(flow_id, execution_id = %outcome.record.execution_id, "Webhook flow finished");
        Ok(FlowExecution::from(&outcome))
    }
}

/// Whether the pipeline keeps going after `flow` ran.
pub fn continues_pipeline(flow: &Flow, outcome: &ExecutionOutcome) -> bool {
    match flow.execution_strategy {
        ExecutionStrategy::StopOnMatch => flow.allow_passthrough,
        ExecutionStrategy::AlwaysContinue => true,
        ExecutionStrategy::Conditional => match outcome.variable(CONTINUE_VARIABLE) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => flow.allow_passthrough,
        },
    }
}

/// Flow input for a message-triggered run.
fn message_input(message: &InboundMessage) -> Value {
    serde_json::to_value(message).unwrap_or_else(|_| json!({"text": message.text}))
}
