//! Priority dispatch of inbound messages: preprocessing, high-priority flows,
//! shortcuts, standard flows and the AI router, swarm delegation, and the
//! classification-plus-failover fallback.

pub mod intent;
pub mod pipeline;
pub mod preprocess;
pub mod result;
pub mod shortcuts;
pub mod swarm;
pub mod trigger;
pub mod trigger_auth;

pub use intent::{IntentMatch, IntentReply, IntentRouter, IntentTool, RouterTool};
pub use pipeline::{continues_pipeline, DispatchPipeline, CONTINUE_VARIABLE};
pub use preprocess::{Disposition, Preprocessor};
pub use result::{
    FlowExecution, PipelineResult, PipelineResultType, PipelineTier, ProviderMeta, TraceEntry,
    RESPONSE_VARIABLE,
};
pub use shortcuts::ShortcutTable;
pub use swarm::{
    ChannelDelegator, DelegationReceipt, DelegationRequest, DelegationStatus, Delegator, Persona,
    PersonaRegistry,
};
pub use trigger::{CatalogEntry, FlowCatalog, TriggerFilter};
