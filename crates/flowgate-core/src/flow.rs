//! Flow document model.
//!
//! A flow is a user-authored DAG of typed steps. The JSON shape follows the
//! authoring surface: camelCase top-level fields, `type` as `category:subtype`,
//! and node config either inline (`config`) or nested under `data.config`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FlowgateError;

pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Closed set of step types, keyed by `category:subtype`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StepKind {
    ManualTrigger,
    MessageTrigger,
    WebhookTrigger,
    ScheduleTrigger,
    SetVariable,
    Transform,
    Log,
    HttpRequest,
    SendMessage,
    AiTask,
    Condition,
    Switch,
    Loop,
    Delay,
    ErrorHandler,
}

impl StepKind {
    pub const ALL: [StepKind; 15] = [
        StepKind::ManualTrigger,
        StepKind::MessageTrigger,
        StepKind::WebhookTrigger,
        StepKind::ScheduleTrigger,
        StepKind::SetVariable,
        StepKind::Transform,
        StepKind::Log,
        StepKind::HttpRequest,
        StepKind::SendMessage,
        StepKind::AiTask,
        StepKind::Condition,
        StepKind::Switch,
        StepKind::Loop,
        StepKind::Delay,
        StepKind::ErrorHandler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualTrigger => "trigger:manual",
            Self::MessageTrigger => "trigger:message",
            Self::WebhookTrigger => "trigger:webhook",
            Self::ScheduleTrigger => "trigger:schedule",
            Self::SetVariable => "action:set_variable",
            Self::Transform => "action:transform",
            Self::Log => "action:log",
            Self::HttpRequest => "action:http_request",
            Self::SendMessage => "action:send_message",
            Self::AiTask => "action:ai_task",
            Self::Condition => "logic:condition",
            Self::Switch => "logic:switch",
            Self::Loop => "logic:loop",
            Self::Delay => "logic:delay",
            Self::ErrorHandler => "logic:error_handler",
        }
    }

    pub fn category(&self) -> &'static str {
        self.as_str().split(':').next().unwrap_or_default()
    }

    pub fn is_trigger(&self) -> bool {
        self.category() == "trigger"
    }

    /// Control-flow steps alter the next-step set instead of only producing data.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::Condition | Self::Switch | Self::Loop | Self::Delay | Self::ErrorHandler
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = FlowgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| FlowgateError::UnknownStepType(s.to_string()))
    }
}

impl TryFrom<String> for StepKind {
    type Error = FlowgateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Authoring-surface payload nested under a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub config: ConfigMap,
}

/// One unit of work in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: ConfigMap,
    #[serde(default)]
    pub data: NodeData,
    /// Branch name to target node id, for multi-branch steps.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            config: ConfigMap::new(),
            data: NodeData::default(),
            outputs: HashMap::new(),
        }
    }

    /// Replace the inline config with the given JSON object.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = config {
            self.config = map;
        }
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.data.label = Some(label.into());
        self
    }

    pub fn with_output(mut self, branch: impl Into<String>, target: impl Into<String>) -> Self {
        self.outputs.insert(branch.into(), target.into());
        self
    }

    /// Effective config: inline `config`, else `data.config`.
    pub fn config(&self) -> &ConfigMap {
        if self.config.is_empty() {
            &self.data.config
        } else {
            &self.config
        }
    }

    pub fn label(&self) -> &str {
        self.data.label.as_deref().unwrap_or(&self.id)
    }
}

/// A dependency between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            source_handle: None,
        }
    }

    /// Edge leaving a specific branch handle (e.g. `true`, `body`, `error`).
    pub fn from_handle(
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let handle = handle.into();
        let mut edge = Self::new(source, target);
        edge.id = format!("{}:{}", edge.id, handle);
        edge.source_handle = Some(handle);
        edge
    }

    pub fn handle(&self) -> Option<&str> {
        self.source_handle.as_deref()
    }
}

/// How the dispatch pipeline proceeds after this flow matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    StopOnMatch,
    AlwaysContinue,
    Conditional,
}

/// Which inbound items start this flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowTrigger {
    /// Restrict to these channels (empty = any channel).
    #[serde(default)]
    pub channels: Vec<String>,
    /// `op:value` filters; all must match.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Authentication required by the webhook entry point.
    #[serde(default)]
    pub auth: TriggerAuth,
}

/// How an externally triggered run proves it may start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
    HmacSha256 {
        secret: String,
        #[serde(default = "default_signature_header")]
        header: String,
    },
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_signature_header() -> String {
    "x-signature-256".to_string()
}

/// A user-authored automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub allow_passthrough: bool,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default)]
    pub trigger: FlowTrigger,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_enabled() -> bool {
    true
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            nodes: vec![],
            edges: vec![],
            priority: DEFAULT_PRIORITY,
            allow_passthrough: false,
            execution_strategy: ExecutionStrategy::default(),
            trigger: FlowTrigger::default(),
            enabled: true,
        }
    }

    /// Parse a flow document from JSON.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn is_high_priority(&self, min: u8) -> bool {
        self.priority >= min
    }
}
