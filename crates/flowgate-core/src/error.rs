use thiserror::Error;

use crate::types::ProviderError;

#[derive(Debug, Error)]
pub enum FlowgateError {
    // Validation errors
    #[error("Flow validation failed: {}", .0.join("; "))]
    InvalidFlow(Vec<String>),

    #[error("Flow graph contains a cycle ({ordered} of {total} nodes orderable)")]
    CycleDetected { ordered: usize, total: usize },

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    // Execution errors
    #[error("Execution already active: {0}")]
    ExecutionActive(String),

    #[error("Node {node_id} failed: {message}")]
    NodeFailed { node_id: String, message: String },

    #[error("Loop exceeded hard iteration ceiling ({0})")]
    LoopCeiling(usize),

    #[error("Execution cancelled")]
    Cancelled,

    // Provider errors
    #[error("Provider {provider} failed: {error}")]
    Provider {
        provider: String,
        error: ProviderError,
    },

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Failover chain exhausted after {} attempts: {}", .attempts.len(), .attempts.join(" | "))]
    ChainExhausted { attempts: Vec<String> },

    #[error("Failover chain is empty for tier {0}")]
    EmptyChain(String),

    // Pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Delegation failed: {0}")]
    Delegation(String),

    // Auth errors
    #[error("Trigger authentication failed: {0}")]
    Unauthorized(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowgateError {
    /// Transient failures that may be retried or failed over from.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Provider { error, .. } => error.kind.is_recoverable(),
            _ => false,
        }
    }

    /// Validation errors are reported before any step runs.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidFlow(_)
                | Self::CycleDetected { .. }
                | Self::UnknownStepType(_)
                | Self::FlowNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowgateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderErrorKind;

    #[test]
    fn test_recoverable_provider_error() {
        let err = FlowgateError::Provider {
            provider: "openai".into(),
            error: ProviderError::new(ProviderErrorKind::RateLimited, "slow down"),
        };
        assert!(err.is_recoverable());

        let err = FlowgateError::Provider {
            provider: "openai".into(),
            error: ProviderError::new(ProviderErrorKind::Unauthorized, "bad key"),
        };
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_validation_errors() {
        assert!(FlowgateError::CycleDetected { ordered: 1, total: 3 }.is_validation());
        assert!(FlowgateError::InvalidFlow(vec!["x".into()]).is_validation());
        assert!(!FlowgateError::Cancelled.is_validation());
    }

    #[test]
    fn test_chain_exhausted_message() {
        let err = FlowgateError::ChainExhausted {
            attempts: vec!["a/m1: rate limited".into(), "b/m2: unauthorized".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 attempts"));
        assert!(msg.contains("a/m1"));
    }
}
