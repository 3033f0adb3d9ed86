use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowgateError, Result};
use crate::types::{FailoverChainEntry, TaskTier};

/// Hard ceiling on loop iterations regardless of configuration.
pub const LOOP_ITERATION_CEILING: usize = 10_000;

/// Top-level Flowgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub personas: Vec<PersonaConfig>,
    #[serde(default)]
    pub intents: Vec<IntentConfig>,
}

/// DAG executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Per-node timeout in milliseconds.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Default loop bound; clamped to `LOOP_ITERATION_CEILING`.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Initial backoff for error-handler retries without explicit policy.
    #[serde(default = "default_retry_backoff_ms")]
    pub default_retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: default_node_timeout_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            max_delay_ms: default_max_delay_ms(),
            event_capacity: default_event_capacity(),
            default_retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn loop_limit(&self) -> usize {
        self.max_loop_iterations.min(LOOP_ITERATION_CEILING)
    }
}

fn default_node_timeout_ms() -> u64 { 30_000 }
fn default_max_loop_iterations() -> usize { 1_000 }
fn default_max_delay_ms() -> u64 { 3_600_000 }
fn default_event_capacity() -> usize { 256 }
fn default_retry_backoff_ms() -> u64 { 1_000 }
fn default_max_retry_backoff_ms() -> u64 { 30_000 }

/// Template resolver settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Environment variables visible to `{{env.NAME}}`.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
}

/// Legacy single provider/model setting for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierModelConfig {
    pub provider: String,
    pub model: String,
}

/// Per-user (or deployment-wide) routing preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-attempt timeout against a single chain entry.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Legacy per-tier single-provider settings.
    #[serde(default)]
    pub tiers: HashMap<TaskTier, TierModelConfig>,
    /// Custom failover chains; take priority over `tiers`.
    #[serde(default)]
    pub chains: HashMap<TaskTier, Vec<FailoverChainEntry>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            tiers: HashMap::new(),
            chains: HashMap::new(),
        }
    }
}

fn default_attempt_timeout_ms() -> u64 { 60_000 }

/// Connection settings for one provider client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    /// Extra request headers; override preset headers of the same name.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider_kind() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }

/// Relative ordering of standard flows and the AI Router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    FlowFirst,
    AiFirst,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: RoutingMode,
    /// Flows at or above this priority run in the high-priority tier.
    #[serde(default = "default_high_priority_min")]
    pub high_priority_min: u8,
    /// Shortcut command → canned response.
    #[serde(default)]
    pub shortcuts: HashMap<String, String>,
    /// Minimum persona score for swarm delegation.
    #[serde(default = "default_min_persona_score")]
    pub min_persona_score: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::default(),
            high_priority_min: default_high_priority_min(),
            shortcuts: HashMap::new(),
            min_persona_score: default_min_persona_score(),
        }
    }
}

fn default_high_priority_min() -> u8 { 8 }
fn default_min_persona_score() -> f64 { 1.0 }

/// Rules for tier-0 message classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default)]
    pub skip_senders: Vec<String>,
    #[serde(default)]
    pub passive_channels: Vec<String>,
    /// Regexes; a match hands the message to background ingestion.
    #[serde(default)]
    pub passive_patterns: Vec<String>,
    #[serde(default)]
    pub min_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

/// A specialized persona available for swarm delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A keyword intent answered through the AI task router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    pub name: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowgateError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowgateError::Config(e.to_string()))
    }

    /// Default config location (`~/.flowgate/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs_home().map(|h| h.join(".flowgate").join("config.toml"))
    }

    /// Resolve the SQLite store path (expand ~).
    pub fn store_path(&self) -> Option<PathBuf> {
        let path = &self.store.as_ref()?.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(path))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
