//! Mocks and fixtures shared by Flowgate's test suites.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::flow::{Edge, ExecutionStrategy, Flow, Node, StepKind};
use flowgate_core::record::ExecutionRecord;
use flowgate_core::traits::{ExecutionStore, MessageSender, PassiveIngest, ProviderClient};
use flowgate_core::types::{
    InboundMessage, ProviderError, ProviderErrorKind, ProviderRequest, ProviderResponse, Usage,
};

// ── ScriptedProvider ────────────────────────────────────────────

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(ProviderError),
    /// Sleep before answering, to trip attempt timeouts.
    Slow(Duration, String),
}

/// Provider client that plays back replies in order, repeating the last one.
pub struct ScriptedProvider {
    name: String,
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, replies: Vec<Reply>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            models: Mutex::new(vec![]),
        }
    }

    pub fn ok(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, vec![Reply::Text(text.into())])
    }

    pub fn failing(name: impl Into<String>, kind: ProviderErrorKind) -> Self {
        Self::new(
            name,
            vec![Reply::Fail(ProviderError::new(kind, format!("{:?}", kind)))],
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Models requested so far, in call order.
    pub fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Reply {
        let mut queue = self.replies.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(reply) = queue.pop_front() {
            *last = Some(reply.clone());
            return reply;
        }
        last.clone().unwrap_or_else(|| Reply::Text(String::new()))
    }
}

impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete<'a>(
        &'a self,
        model: &'a str,
        request: &'a ProviderRequest,
    ) -> BoxFuture<'a, std::result::Result<ProviderResponse, ProviderError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(model.to_string());
        let reply = self.next_reply();
        let prompt_len = request.description().len() as u64;
        Box::pin(async move {
            let text = match reply {
                Reply::Text(text) => text,
                Reply::Fail(err) => return Err(err),
                Reply::Slow(delay, text) => {
                    tokio::time::sleep(delay).await;
                    text
                }
            };
            Ok(ProviderResponse {
                usage: Usage {
                    input_tokens: prompt_len,
                    output_tokens: text.len() as u64,
                },
                content: text,
            })
        })
    }
}

// ── RecordingStore ──────────────────────────────────────────────

/// In-memory `ExecutionStore` that keeps everything for assertions.
#[derive(Default)]
pub struct RecordingStore {
    records: Mutex<Vec<ExecutionRecord>>,
    log: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    appends: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the replay log for an execution.
    pub fn with_logged(self, execution_id: &str, node_id: &str, output: Value) -> Self {
        self.log
            .lock()
            .unwrap()
            .entry(execution_id.to_string())
            .or_default()
            .insert(node_id.to_string(), output);
        self
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

impl ExecutionStore for RecordingStore {
    fn save_execution_record(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        self.records.lock().unwrap().push(record.clone());
        Box::pin(async { Ok(()) })
    }

    fn append_node_output(
        &self,
        execution_id: &str,
        node_id: &str,
        output: &Value,
    ) -> BoxFuture<'_, Result<()>> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .entry(execution_id.to_string())
            .or_default()
            .insert(node_id.to_string(), output.clone());
        Box::pin(async { Ok(()) })
    }

    fn load_node_outputs(
        &self,
        execution_id: &str,
    ) -> BoxFuture<'_, Result<BTreeMap<String, Value>>> {
        let found = self
            .log
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(found) })
    }

    fn load_execution_record(
        &self,
        execution_id: &str,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let found = self
            .records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.execution_id == execution_id)
            .cloned();
        Box::pin(async move { Ok(found) })
    }
}

// ── RecordingSender ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub channel: String,
    pub recipient: String,
    pub text: String,
}

/// `MessageSender` that records every send. Optionally fails.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentMessage>>,
    fail: bool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl MessageSender for RecordingSender {
    fn send<'a>(
        &'a self,
        channel: &'a str,
        recipient: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if self.fail {
                return Err(FlowgateError::Pipeline(format!("{} is unavailable", channel)));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(SentMessage {
                channel: channel.to_string(),
                recipient: recipient.to_string(),
                text: text.to_string(),
            });
            Ok(format!("msg-{}", sent.len()))
        })
    }
}

// ── CollectingIngest ────────────────────────────────────────────

/// `PassiveIngest` that collects messages and wakes waiters.
#[derive(Default)]
pub struct CollectingIngest {
    messages: Mutex<Vec<InboundMessage>>,
    notify: tokio::sync::Notify,
}

impl CollectingIngest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Wait until at least `n` messages arrived, or the timeout passes.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.messages.lock().unwrap().len() >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.messages.lock().unwrap().len() >= n;
            }
        }
    }
}

impl PassiveIngest for CollectingIngest {
    fn ingest(&self, message: InboundMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.messages.lock().unwrap().push(message);
            self.notify.notify_waiters();
            Ok(())
        })
    }
}

// ── FlowBuilder ─────────────────────────────────────────────────

/// Fluent construction of flows for tests.
pub struct FlowBuilder {
    flow: Flow,
}

impl FlowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            flow: Flow::new(id),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.flow.priority = priority;
        self
    }

    pub fn passthrough(mut self) -> Self {
        self.flow.allow_passthrough = true;
        self
    }

    pub fn strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.flow.execution_strategy = strategy;
        self
    }

    pub fn filter(mut self, filter: &str) -> Self {
        self.flow.trigger.filters.push(filter.to_string());
        self
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.flow.trigger.channels.push(channel.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.flow.enabled = false;
        self
    }

    pub fn node(mut self, id: &str, kind: StepKind, config: Value) -> Self {
        self.flow.nodes.push(Node::new(id, kind).with_config(config));
        self
    }

    /// Add a fully built node (for `outputs` maps and labels).
    pub fn raw_node(mut self, node: Node) -> Self {
        self.flow.nodes.push(node);
        self
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.flow.edges.push(Edge::new(source, target));
        self
    }

    pub fn branch(mut self, source: &str, handle: &str, target: &str) -> Self {
        self.flow.edges.push(Edge::from_handle(source, handle, target));
        self
    }

    /// Chain nodes with plain edges in the given order.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self.flow.edges.push(Edge::new(pair[0], pair[1]));
        }
        self
    }

    pub fn build(self) -> Flow {
        self.flow
    }
}

/// A message-triggered flow that sets `matched_by` to its own id.
pub fn marker_flow(id: &str, priority: u8) -> FlowBuilder {
    FlowBuilder::new(id)
        .priority(priority)
        .node("start", StepKind::MessageTrigger, serde_json::json!({}))
        .node(
            "mark",
            StepKind::SetVariable,
            serde_json::json!({"name": "matched_by", "value": id}),
        )
        .edge("start", "mark")
}

// ── Config fixtures ─────────────────────────────────────────────

/// Write `contents` to `config.toml` inside a fresh temp dir.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

/// Parse an inline TOML snippet into `AppConfig`.
pub fn config_from_toml(contents: &str) -> flowgate_core::AppConfig {
    toml::from_str(contents).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_repeats_last_reply() {
        let p = ScriptedProvider::new(
            "p",
            vec![
                Reply::Fail(ProviderError::new(ProviderErrorKind::RateLimited, "slow down")),
                Reply::Text("ok".into()),
            ],
        );
        let req = ProviderRequest::task("u", "hi");
        assert!(p.complete("m", &req).await.is_err());
        assert_eq!(p.complete("m", &req).await.unwrap().content, "ok");
        assert_eq!(p.complete("m2", &req).await.unwrap().content, "ok");
        assert_eq!(p.calls(), 3);
        assert_eq!(p.models(), vec!["m", "m", "m2"]);
    }

    #[tokio::test]
    async fn test_recording_store_roundtrip() {
        let store = RecordingStore::new().with_logged("e1", "a", serde_json::json!(1));
        store
            .append_node_output("e1", "b", &serde_json::json!(2))
            .await
            .unwrap();
        let outputs = store.load_node_outputs("e1").await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(store.load_node_outputs("e2").await.unwrap().is_empty());
        assert_eq!(store.appends(), 1);
    }

    #[tokio::test]
    async fn test_collecting_ingest_wakes_waiter() {
        let ingest = std::sync::Arc::new(CollectingIngest::new());
        let bg = ingest.clone();
        tokio::spawn(async move {
            bg.ingest(InboundMessage::new("feed", "bot", "fyi")).await.unwrap();
        });
        assert!(ingest.wait_for(1, Duration::from_secs(2)).await);
    }

    #[test]
    fn test_flow_builder_chain() {
        let flow = FlowBuilder::new("f")
            .node("a", StepKind::ManualTrigger, serde_json::json!({}))
            .node("b", StepKind::Log, serde_json::json!({"message": "x"}))
            .node("c", StepKind::Log, serde_json::json!({"message": "y"}))
            .chain(&["a", "b", "c"])
            .priority(9)
            .build();
        assert_eq!(flow.edges.len(), 2);
        assert_eq!(flow.priority, 9);
    }
}
