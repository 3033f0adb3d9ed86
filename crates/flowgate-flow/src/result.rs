use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes attached to failed step results.
pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const VALIDATION: &str = "VALIDATION";
    pub const HTTP_ERROR: &str = "HTTP_ERROR";
    pub const NETWORK: &str = "NETWORK_ERROR";
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
    pub const CHAIN_EXHAUSTED: &str = "CHAIN_EXHAUSTED";
    pub const SEND_FAILED: &str = "SEND_FAILED";
    pub const NOT_CONFIGURED: &str = "NOT_CONFIGURED";
    pub const LOOP_LIMIT: &str = "LOOP_LIMIT";
    pub const UNKNOWN: &str = "UNKNOWN";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    pub code: String,
}

/// Outcome of one step execution. Produced once per node per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default)]
    pub is_recoverable: bool,
    /// Explicit successor set; overrides edge activation when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_nodes: Option<Vec<String>>,
}

impl NodeExecutionResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            is_recoverable: false,
            next_nodes: None,
        }
    }

    pub fn success_with_next(data: Value, next_nodes: Vec<String>) -> Self {
        Self {
            next_nodes: Some(next_nodes),
            ..Self::success(data)
        }
    }

    /// A fatal failure.
    pub fn failure(message: impl Into<String>, code: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(StepError {
                message: message.into(),
                code: code.to_string(),
            }),
            is_recoverable: false,
            next_nodes: None,
        }
    }

    /// A transient failure, eligible for retry or handler takeover.
    pub fn recoverable_failure(message: impl Into<String>, code: &str) -> Self {
        Self {
            is_recoverable: true,
            ..Self::failure(message, code)
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::recoverable_failure(format!("step timed out after {}ms", after_ms), codes::TIMEOUT)
    }

    /// Branch name reported by control-flow steps (`data.branch`).
    pub fn branch(&self) -> Option<&str> {
        self.data.as_ref()?.get("branch")?.as_str()
    }

    pub fn error_message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown error")
    }

    pub fn error_code(&self) -> &str {
        self.error.as_ref().map(|e| e.code.as_str()).unwrap_or(codes::UNKNOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_helpers() {
        let ok = NodeExecutionResult::success_with_next(json!({"branch": "true"}), vec!["b".into()]);
        assert!(ok.success);
        assert_eq!(ok.branch(), Some("true"));
        assert_eq!(ok.next_nodes.as_deref(), Some(&["b".to_string()][..]));

        let fatal = NodeExecutionResult::failure("bad config", codes::VALIDATION);
        assert!(!fatal.is_recoverable);
        assert_eq!(fatal.error_code(), "VALIDATION");

        let timeout = NodeExecutionResult::timeout(50);
        assert!(timeout.is_recoverable);
        assert_eq!(timeout.error_code(), codes::TIMEOUT);
        assert!(timeout.error_message().contains("50ms"));
    }

    #[test]
    fn test_wire_shape() {
        let r = NodeExecutionResult::recoverable_failure("slow", codes::HTTP_ERROR);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["isRecoverable"], true);
        assert_eq!(v["error"]["code"], "HTTP_ERROR");
        assert!(v.get("nextNodes").is_none());
    }
}
