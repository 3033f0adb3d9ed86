use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::record::ExecutionRecord;
use crate::types::*;

/// Provider client — one upstream model API.
pub trait ProviderClient: Send + Sync + 'static {
    /// Provider name as used in failover chains (e.g., "openai").
    fn name(&self) -> &str;

    /// Run a single completion against `model`.
    fn complete<'a>(
        &'a self,
        model: &'a str,
        request: &'a ProviderRequest,
    ) -> BoxFuture<'a, std::result::Result<ProviderResponse, ProviderError>>;
}

/// Execution store — persistence backend for run records and the replay log.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Persist the final record of a run.
    fn save_execution_record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>>;

    /// Append one completed node output to the replay log.
    fn append_node_output(
        &self,
        execution_id: &str,
        node_id: &str,
        output: &serde_json::Value,
    ) -> BoxFuture<'_, Result<()>>;

    /// Node outputs already logged for an execution (empty if none).
    fn load_node_outputs(
        &self,
        execution_id: &str,
    ) -> BoxFuture<'_, Result<BTreeMap<String, serde_json::Value>>>;

    /// Load a saved run record.
    fn load_execution_record(
        &self,
        execution_id: &str,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>>;
}

/// Outbound messaging platform, used by send-message steps.
pub trait MessageSender: Send + Sync + 'static {
    /// Deliver `text` to `recipient` on `channel`. Returns a platform message id.
    fn send<'a>(
        &'a self,
        channel: &'a str,
        recipient: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Runs an AI task with classification and provider failover.
pub trait AiTaskRunner: Send + Sync + 'static {
    fn run_task(&self, request: ProviderRequest) -> BoxFuture<'_, Result<ProviderResult>>;
}

/// Background ingestion for passive messages (knowledge capture, indexing).
pub trait PassiveIngest: Send + Sync + 'static {
    fn ingest(&self, message: InboundMessage) -> BoxFuture<'_, Result<()>>;
}
