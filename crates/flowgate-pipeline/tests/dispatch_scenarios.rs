use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use flowgate_core::config::{ExecutorConfig, PipelineConfig, PreprocessConfig, RouterConfig, RoutingMode};
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::EventBus;
use flowgate_core::flow::{ExecutionStrategy, StepKind, TriggerAuth};
use flowgate_core::record::RunStatus;
use flowgate_core::types::{InboundMessage, ProviderErrorKind};
use flowgate_flow::{FlowExecutor, StepDeps, StepRegistry, VariableResolver};
use flowgate_pipeline::trigger_auth::sign;
use flowgate_pipeline::{
    ChannelDelegator, DispatchPipeline, FlowCatalog, IntentReply, IntentRouter, IntentTool,
    Persona, PersonaRegistry, PipelineResultType, PipelineTier,
};
use flowgate_router::TaskRouter;
use flowgate_test_utils::{marker_flow, CollectingIngest, FlowBuilder, ScriptedProvider};

/// Intent tool that counts calls.
#[derive(Default)]
struct CountingTool {
    calls: AtomicUsize,
}

impl CountingTool {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IntentTool for CountingTool {
    fn name(&self) -> &str {
        "counting"
    }

    fn execute<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<IntentReply>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(IntentReply::text(format!("handled: {}", message.text))) })
    }
}

fn executor() -> Arc<FlowExecutor> {
    Arc::new(FlowExecutor::new(
        Arc::new(StepRegistry::with_builtins(StepDeps::default())),
        Arc::new(VariableResolver::default()),
        Arc::new(EventBus::new(256)),
        ExecutorConfig::default(),
    ))
}

fn catalog(flows: Vec<flowgate_core::flow::Flow>) -> FlowCatalog {
    let mut catalog = FlowCatalog::new();
    for flow in flows {
        catalog.add(flow).unwrap();
    }
    catalog
}

fn intents(tool: &Arc<CountingTool>) -> IntentRouter {
    IntentRouter::new().with_intent("ops", &["server", "deploy", "notes"], tool.clone())
}

fn msg(text: &str) -> InboundMessage {
    InboundMessage::new("chat", "ann", text)
}

#[tokio::test]
async fn test_help_server_down_stops_at_high_priority_flow() {
    let tool = Arc::new(CountingTool::default());
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![marker_flow("pager", 10).filter("contains:\"HELP\"").build()]))
        .with_intents(intents(&tool));

    let result = pipeline.dispatch(msg("HELP, server down")).await;

    assert_eq!(result.result_type, PipelineResultType::FlowExecuted);
    assert_eq!(result.tier, Some(PipelineTier::HighPriorityFlow));
    assert!(!result.invoked(PipelineTier::AiRouter));
    assert_eq!(tool.calls(), 0);
    let exec = result.flow_execution.as_ref().unwrap();
    assert_eq!(exec.flow_id, "pager");
    assert!(exec.success);

    let wire = serde_json::to_value(&result).unwrap();
    assert_eq!(wire["type"], "FLOW_EXECUTED");
    assert_eq!(wire["tier"], "high_priority_flow");
}

#[tokio::test]
async fn test_priority_nine_runs_before_any_later_tier() {
    let tool = Arc::new(CountingTool::default());
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![
            marker_flow("standard", 5).build(),
            marker_flow("urgent", 9).build(),
        ]))
        .with_intents(intents(&tool));

    let result = pipeline.dispatch(msg("server on fire")).await;

    assert_eq!(result.flow_execution.unwrap().flow_id, "urgent");
    assert_eq!(
        result.trace.iter().map(|t| t.tier).collect::<Vec<_>>(),
        vec![PipelineTier::Preprocess, PipelineTier::HighPriorityFlow]
    );
    assert_eq!(tool.calls(), 0);
}

#[tokio::test]
async fn test_passthrough_flow_still_reaches_ai_router() {
    let tool = Arc::new(CountingTool::default());
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![marker_flow("notes", 5).passthrough().build()]))
        .with_intents(intents(&tool));

    let result = pipeline.dispatch(msg("take notes on the deploy")).await;

    assert_eq!(result.result_type, PipelineResultType::AiRouted);
    assert_eq!(result.tier, Some(PipelineTier::AiRouter));
    assert_eq!(result.response.as_deref(), Some("handled: take notes on the deploy"));
    let prior = result.prior_flow_execution.as_ref().unwrap();
    assert_eq!(prior.flow_id, "notes");
    assert_eq!(prior.status, RunStatus::Completed);
    assert_eq!(tool.calls(), 1);
    assert_eq!(
        result.tiers(),
        vec![
            PipelineTier::Preprocess,
            PipelineTier::HighPriorityFlow,
            PipelineTier::Shortcut,
            PipelineTier::StandardFlow,
            PipelineTier::AiRouter,
        ]
    );
}

#[tokio::test]
async fn test_high_priority_passthrough_carried_to_standard_flow() {
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default()).with_flows(catalog(vec![
        marker_flow("audit", 10).passthrough().build(),
        marker_flow("reply", 3).build(),
    ]));

    let result = pipeline.dispatch(msg("anything at all")).await;

    assert_eq!(result.tier, Some(PipelineTier::StandardFlow));
    assert_eq!(result.flow_execution.unwrap().flow_id, "reply");
    assert_eq!(result.prior_flow_execution.unwrap().flow_id, "audit");
}

#[tokio::test]
async fn test_skip_and_passive() {
    let ingest = Arc::new(CollectingIngest::new());
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_preprocess(PreprocessConfig {
            skip_senders: vec!["noreply".into()],
            passive_channels: vec!["feed".into()],
            ..Default::default()
        })
        .unwrap()
        .with_flows(catalog(vec![marker_flow("any", 9).build()]))
        .with_ingest(ingest.clone());

    let skipped = pipeline.dispatch(InboundMessage::new("chat", "noreply", "invoice")).await;
    assert_eq!(skipped.result_type, PipelineResultType::Skipped);
    assert_eq!(skipped.tiers(), vec![PipelineTier::Preprocess]);

    let blank = pipeline.dispatch(msg("   ")).await;
    assert_eq!(blank.result_type, PipelineResultType::Skipped);

    let passive = pipeline.dispatch(InboundMessage::new("feed", "rss", "release notes")).await;
    assert_eq!(passive.result_type, PipelineResultType::Passive);
    assert!(passive.flow_execution.is_none());
    assert!(ingest.wait_for(1, Duration::from_secs(5)).await);
    assert_eq!(ingest.messages()[0].text, "release notes");
}

#[tokio::test]
async fn test_shortcuts_after_high_priority_flows() {
    let mut config = PipelineConfig::default();
    config
        .shortcuts
        .insert("/status".into(), "all systems nominal".into());
    let pipeline = DispatchPipeline::new(executor(), config).with_flows(catalog(vec![
        marker_flow("status-flow", 8).filter("starts_with:/status").build(),
        marker_flow("catch-all", 4).build(),
    ]));

    let ping = pipeline.dispatch(msg("/ping")).await;
    assert_eq!(ping.result_type, PipelineResultType::Shortcut);
    assert_eq!(ping.response.as_deref(), Some("pong"));
    assert!(!ping.invoked(PipelineTier::StandardFlow));

    let status = pipeline.dispatch(msg("/status now")).await;
    assert_eq!(status.result_type, PipelineResultType::FlowExecuted);
    assert_eq!(status.flow_execution.unwrap().flow_id, "status-flow");
}

#[tokio::test]
async fn test_ai_first_skips_flows_when_handled() {
    let tool = Arc::new(CountingTool::default());
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![marker_flow("standard", 5).build()]))
        .with_intents(intents(&tool));

    let handled = pipeline
        .dispatch_with_mode(msg("deploy the api"), RoutingMode::AiFirst)
        .await;
    assert_eq!(handled.result_type, PipelineResultType::AiRouted);
    assert!(!handled.invoked(PipelineTier::StandardFlow));

    let unhandled = pipeline
        .dispatch_with_mode(msg("what's for lunch"), RoutingMode::AiFirst)
        .await;
    assert_eq!(unhandled.result_type, PipelineResultType::FlowExecuted);
    assert_eq!(
        unhandled.tiers()[3..].to_vec(),
        vec![PipelineTier::AiRouter, PipelineTier::StandardFlow]
    );
    assert_eq!(tool.calls(), 1);
}

#[tokio::test]
async fn test_flow_first_passthrough_skips_ai_but_reaches_swarm() {
    let tool = Arc::new(CountingTool::default());
    let (delegator, mut rx) = ChannelDelegator::new(8);
    let mut personas = PersonaRegistry::new();
    personas.register(Persona::new("sre", "Site Reliability").with_skills(&["server", "outage"]));

    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![marker_flow("log-all", 2).passthrough().build()]))
        .with_intents(intents(&tool))
        .with_personas(personas)
        .with_delegator(Arc::new(delegator));

    let result = pipeline
        .dispatch_with_mode(msg("server outage in eu-west"), RoutingMode::FlowFirst)
        .await;

    assert_eq!(result.result_type, PipelineResultType::Delegated);
    assert!(!result.invoked(PipelineTier::AiRouter));
    assert_eq!(tool.calls(), 0);
    let receipt = result.delegation.unwrap();
    assert_eq!(receipt.persona_id, "sre");
    assert_eq!(receipt.score, 2.0);
    assert_eq!(result.prior_flow_execution.unwrap().flow_id, "log-all");
    assert_eq!(rx.recv().await.unwrap().receipt.delegation_id, receipt.delegation_id);
}

#[tokio::test]
async fn test_balanced_falls_back_to_router() {
    let provider = Arc::new(ScriptedProvider::ok("openai", "Try turning it off and on."));
    let router = Arc::new(TaskRouter::new(RouterConfig::default()).with_client(provider.clone()));
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default()).with_router(router);

    let result = pipeline.dispatch(msg("my laptop will not boot")).await;

    assert_eq!(result.result_type, PipelineResultType::Fallback);
    assert_eq!(result.tier, Some(PipelineTier::Fallback));
    assert_eq!(result.response.as_deref(), Some("Try turning it off and on."));
    assert_eq!(result.provider.as_ref().unwrap().provider, "openai");
    assert!(result.classification.is_some());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_fallback_exhaustion_is_error_result() {
    let provider = Arc::new(ScriptedProvider::failing("openai", ProviderErrorKind::Unauthorized));
    let router = Arc::new(TaskRouter::new(RouterConfig::default()).with_client(provider));
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default()).with_router(router);

    let result = pipeline.dispatch(msg("summarize yesterday's incident report")).await;

    assert_eq!(result.result_type, PipelineResultType::Error);
    assert_eq!(result.tier, Some(PipelineTier::Fallback));
    assert!(result.error.unwrap().contains("exhausted"));
    assert!(result.classification.is_some());
}

#[tokio::test]
async fn test_conditional_strategy_reads_run_variable() {
    let tool = Arc::new(CountingTool::default());
    let flows = catalog(vec![
        FlowBuilder::new("gate")
            .priority(5)
            .strategy(ExecutionStrategy::Conditional)
            .filter("contains:deploy")
            .node("start", StepKind::MessageTrigger, json!({}))
            .node(
                "decide",
                StepKind::SetVariable,
                json!({"name": "continue_pipeline", "value": true}),
            )
            .edge("start", "decide")
            .build(),
        FlowBuilder::new("hold")
            .priority(5)
            .strategy(ExecutionStrategy::Conditional)
            .filter("contains:server")
            .node("start", StepKind::MessageTrigger, json!({}))
            .build(),
    ]);
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(flows)
        .with_intents(intents(&tool));

    let go = pipeline.dispatch(msg("deploy now")).await;
    assert_eq!(go.result_type, PipelineResultType::AiRouted);
    assert_eq!(go.prior_flow_execution.unwrap().flow_id, "gate");

    let stop = pipeline.dispatch(msg("server restart")).await;
    assert_eq!(stop.result_type, PipelineResultType::FlowExecuted);
    assert_eq!(stop.flow_execution.unwrap().flow_id, "hold");
    assert_eq!(tool.calls(), 1);
}

#[tokio::test]
async fn test_passthrough_alone_reports_its_flow() {
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![marker_flow("observer", 6).passthrough().build()]));

    let result = pipeline.dispatch(msg("hello there")).await;
    assert_eq!(result.result_type, PipelineResultType::FlowExecuted);
    assert_eq!(result.tier, Some(PipelineTier::StandardFlow));
    assert_eq!(result.flow_execution.unwrap().flow_id, "observer");
    assert!(result.prior_flow_execution.is_none());

    let empty = DispatchPipeline::new(executor(), PipelineConfig::default());
    assert_eq!(
        empty.dispatch(msg("hello there")).await.result_type,
        PipelineResultType::NoMatch
    );
}

#[tokio::test]
async fn test_invalid_matched_flow_is_skipped() {
    let broken = FlowBuilder::new("broken")
        .priority(9)
        .node("a", StepKind::Log, json!({"message": "a"}))
        .node("b", StepKind::Log, json!({"message": "b"}))
        .chain(&["a", "b", "a"])
        .build();
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![broken, marker_flow("ok", 4).build()]));

    let result = pipeline.dispatch(msg("route me")).await;
    assert_eq!(result.flow_execution.unwrap().flow_id, "ok");
    assert!(result.trace[1].outcome.contains("broken rejected"));
}

#[tokio::test]
async fn test_webhook_requires_valid_signature() {
    let mut hook = FlowBuilder::new("deploy-hook")
        .node("hook", StepKind::WebhookTrigger, json!({}))
        .node("sha", StepKind::SetVariable, json!({"name": "sha", "value": "{{input.sha}}"}))
        .edge("hook", "sha")
        .build();
    hook.trigger.auth = TriggerAuth::HmacSha256 {
        secret: "whsec".into(),
        header: "x-signature-256".into(),
    };
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![hook, marker_flow("chat-only", 5).build()]));

    let body = br#"{"sha": "abc123"}"#;
    let mut headers = HashMap::new();
    headers.insert("X-Signature-256".to_string(), format!("sha256={}", sign("whsec", body)));

    let exec = pipeline.trigger_webhook("deploy-hook", &headers, body).await.unwrap();
    assert!(exec.success);
    assert_eq!(exec.flow_id, "deploy-hook");

    let err = pipeline
        .trigger_webhook("deploy-hook", &headers, br#"{"sha": "evil"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowgateError::Unauthorized(_)));

    assert!(matches!(
        pipeline.trigger_webhook("chat-only", &HashMap::new(), b"{}").await,
        Err(FlowgateError::FlowNotFound(_))
    ));
    assert!(matches!(
        pipeline.trigger_webhook("missing", &HashMap::new(), b"{}").await,
        Err(FlowgateError::FlowNotFound(_))
    ));
}

#[tokio::test]
async fn test_flow_result_carries_its_reply() {
    let pager = FlowBuilder::new("pager")
        .priority(9)
        .filter("contains:HELP")
        .node("start", StepKind::MessageTrigger, json!({}))
        .node("reply", StepKind::Transform, json!({"template": "we are on it: {{input.text}}"}))
        .edge("start", "reply")
        .build();
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![pager]));

    let result = pipeline.dispatch(msg("HELP")).await;
    assert_eq!(result.result_type, PipelineResultType::FlowExecuted);
    assert_eq!(result.response.as_deref(), Some("we are on it: HELP"));
    assert_eq!(
        result.flow_execution.as_ref().and_then(|e| e.response.as_deref()),
        Some("we are on it: HELP")
    );

    // A passthrough flow that nothing later answers still reports its reply.
    let noted = marker_flow("noted", 5)
        .passthrough()
        .node("ack", StepKind::SetVariable, json!({"name": "response", "value": "noted"}))
        .edge("mark", "ack")
        .build();
    let pipeline = DispatchPipeline::new(executor(), PipelineConfig::default())
        .with_flows(catalog(vec![noted]));

    let result = pipeline.dispatch(msg("just saying")).await;
    assert_eq!(result.result_type, PipelineResultType::FlowExecuted);
    assert_eq!(result.tier, Some(PipelineTier::StandardFlow));
    assert_eq!(result.response.as_deref(), Some("noted"));
}
