use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one run. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition(&self, next: RunStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node failure kept on the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorRecord {
    pub node_id: String,
    pub message: String,
    pub code: String,
    pub recoverable: bool,
    /// Id of the error-handler node that took over, if any.
    #[serde(default)]
    pub handled_by: Option<String>,
}

/// Everything persisted about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub node_outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub node_errors: Vec<NodeErrorRecord>,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed && self.node_errors.iter().all(|e| e.handled_by.is_some())
    }
}
