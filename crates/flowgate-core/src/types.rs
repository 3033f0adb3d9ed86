use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a single flow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound work item from any messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub user_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(channel: impl Into<String>, sender: impl Into<String>, text: impl Into<String>) -> Self {
        let sender = sender.into();
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            user_id: sender.clone(),
            sender,
            text: text.into(),
            received_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the sending account flagged itself as a bot.
    pub fn is_bot(&self) -> bool {
        self.metadata
            .get("is_bot")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Provenance of a flow run: what started it and with which payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// "manual", "message", "webhook", "schedule".
    pub source: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TriggerInfo {
    pub fn manual() -> Self {
        Self {
            source: "manual".into(),
            ..Default::default()
        }
    }

    pub fn from_message(msg: &InboundMessage) -> Self {
        Self {
            source: "message".into(),
            channel: Some(msg.channel.clone()),
            sender: Some(msg.sender.clone()),
            message_id: Some(msg.id.clone()),
            metadata: msg.metadata.clone(),
        }
    }

    pub fn webhook(flow_id: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("flow_id".to_string(), serde_json::json!(flow_id));
        Self {
            source: "webhook".into(),
            metadata,
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ── Task routing ───────────────────────────────────────────────

/// Task difficulty, ordered by required model capability and cost.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskTier {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Critical,
}

impl TaskTier {
    pub const ALL: [TaskTier; 5] = [
        TaskTier::Trivial,
        TaskTier::Simple,
        TaskTier::Moderate,
        TaskTier::Complex,
        TaskTier::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
            Self::Critical => "critical",
        }
    }

    /// Tier from a numeric rank (0 = trivial), saturating at critical.
    pub fn from_rank(rank: usize) -> Self {
        Self::ALL[rank.min(Self::ALL.len() - 1)]
    }

    pub fn rank(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for TaskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trivial" => Ok(Self::Trivial),
            "simple" => Ok(Self::Simple),
            "moderate" => Ok(Self::Moderate),
            "complex" => Ok(Self::Complex),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown task tier: {}", other)),
        }
    }
}

/// Outcome of classifying a task description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClassification {
    pub tier: TaskTier,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

/// One provider/model pair in a failover chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverChainEntry {
    pub provider: String,
    pub model: String,
    #[serde(default, rename = "isPrimary", alias = "is_primary")]
    pub is_primary: bool,
}

impl FailoverChainEntry {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            is_primary: false,
        }
    }

    pub fn primary(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            is_primary: true,
            ..Self::new(provider, model)
        }
    }
}

impl fmt::Display for FailoverChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Role in a provider conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }
}

/// A request to the AI task router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    #[serde(default)]
    pub force_tier: Option<TaskTier>,
    #[serde(default)]
    pub force_provider: Option<String>,
}

impl ProviderRequest {
    pub fn task(user_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Text used for classification: the task, or the last user message.
    pub fn description(&self) -> String {
        if let Some(ref task) = self.task {
            return task.clone();
        }
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Messages sent to the provider; a bare task becomes a single user turn.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        if !self.messages.is_empty() {
            return self.messages.clone();
        }
        vec![ChatMessage::user(self.task.clone().unwrap_or_default())]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw completion returned by one provider client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    #[serde(default)]
    pub usage: Usage,
}

/// Structured classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Timeout,
    ServerError,
    Network,
    Unauthorized,
    InvalidRequest,
    ContentFiltered,
    Other,
}

impl ProviderErrorKind {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::ServerError | Self::Network
        )
    }

    /// Map an HTTP status code to an error kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            408 | 504 => Self::Timeout,
            401 | 403 => Self::Unauthorized,
            400 | 404 | 413 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    #[serde(default)]
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::from_status(status),
            message: body.into(),
            status: Some(status),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} (HTTP {}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// One attempt against a chain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub model: String,
    pub succeeded: bool,
    #[serde(default)]
    pub error: Option<ProviderError>,
    pub elapsed_ms: u64,
}

/// Final output of the task router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub tier: TaskTier,
    pub usage: Usage,
    #[serde(default)]
    pub attempts: Vec<ProviderAttempt>,
}

// ── Events ─────────────────────────────────────────────────────

/// Progress event broadcast to all subscribers of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum FlowEvent {
    #[serde(rename = "execution:start")]
    ExecutionStart { execution_id: String, flow_id: String },
    #[serde(rename = "node:start")]
    NodeStart {
        execution_id: String,
        node_id: String,
        #[serde(rename = "type")]
        kind: String,
    },
    #[serde(rename = "node:complete")]
    NodeComplete {
        execution_id: String,
        node_id: String,
        output: serde_json::Value,
        replayed: bool,
    },
    #[serde(rename = "node:error")]
    NodeError {
        execution_id: String,
        node_id: String,
        error: String,
    },
    #[serde(rename = "node:retry")]
    NodeRetry {
        execution_id: String,
        node_id: String,
        attempt: u32,
        backoff_ms: u64,
    },
    #[serde(rename = "execution:complete")]
    ExecutionComplete {
        execution_id: String,
        success: bool,
        output: serde_json::Value,
    },
    #[serde(rename = "execution:error")]
    ExecutionError { execution_id: String, error: String },
}

impl FlowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStart { .. } => "execution:start",
            Self::NodeStart { .. } => "node:start",
            Self::NodeComplete { .. } => "node:complete",
            Self::NodeError { .. } => "node:error",
            Self::NodeRetry { .. } => "node:retry",
            Self::ExecutionComplete { .. } => "execution:complete",
            Self::ExecutionError { .. } => "execution:error",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStart { execution_id, .. }
            | Self::NodeStart { execution_id, .. }
            | Self::NodeComplete { execution_id, .. }
            | Self::NodeError { execution_id, .. }
            | Self::NodeRetry { execution_id, .. }
            | Self::ExecutionComplete { execution_id, .. }
            | Self::ExecutionError { execution_id, .. } => execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(TaskTier::Trivial < TaskTier::Simple);
        assert!(TaskTier::Complex < TaskTier::Critical);
        assert_eq!(TaskTier::from_rank(9), TaskTier::Critical);
        assert_eq!("Moderate".parse::<TaskTier>().unwrap(), TaskTier::Moderate);
        assert!("huge".parse::<TaskTier>().is_err());
    }

    #[test]
    fn test_error_kind_from_status() {
        assert_eq!(ProviderErrorKind::from_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(ProviderErrorKind::from_status(503), ProviderErrorKind::ServerError);
        assert_eq!(ProviderErrorKind::from_status(401), ProviderErrorKind::Unauthorized);
        assert!(ProviderErrorKind::from_status(502).is_recoverable());
        assert!(!ProviderErrorKind::from_status(400).is_recoverable());
    }

    #[test]
    fn test_request_description() {
        let req = ProviderRequest {
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("first"),
                ChatMessage::user("second"),
            ],
            user_id: "u1".into(),
            ..Default::default()
        };
        assert_eq!(req.description(), "second");
        assert_eq!(req.to_messages().len(), 3);

        let req = ProviderRequest::task("u1", "summarize this");
        assert_eq!(req.description(), "summarize this");
        assert_eq!(req.to_messages()[0].content, "summarize this");
    }

    #[test]
    fn test_event_serialization_uses_wire_names() {
        let event = FlowEvent::NodeStart {
            execution_id: "e1".into(),
            node_id: "n1".into(),
            kind: "logic:condition".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "node:start");
        assert_eq!(json["type"], "logic:condition");
        assert_eq!(event.name(), "node:start");
        assert_eq!(event.execution_id(), "e1");
    }

    #[test]
    fn test_chain_entry_accepts_both_spellings() {
        let a: FailoverChainEntry =
            serde_json::from_str(r#"{"provider":"p","model":"m","isPrimary":true}"#).unwrap();
        let b: FailoverChainEntry =
            serde_json::from_str(r#"{"provider":"p","model":"m","is_primary":true}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "p/m");
    }
}
