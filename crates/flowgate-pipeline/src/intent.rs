//! Keyword-scored intents bound to tools. This is the AI Router tier.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use flowgate_core::config::IntentConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::AiTaskRunner;
use flowgate_core::types::{ChatMessage, InboundMessage, ProviderRequest, ProviderResult};

/// What a tool produced for a message.
#[derive(Debug, Clone)]
pub struct IntentReply {
    pub response: String,
    /// Set when the tool went through a provider.
    pub provider: Option<ProviderResult>,
}

impl IntentReply {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            provider: None,
        }
    }
}

/// A tool an intent dispatches to.
pub trait IntentTool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn execute<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<IntentReply>>;

    fn timeout_secs(&self) -> u64 {
        60
    }
}

/// The best-scoring intent for a message.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentMatch {
    pub intent: String,
    pub score: usize,
    pub matched: Vec<String>,
}

struct Intent {
    name: String,
    keywords: Vec<String>,
    tool: Arc<dyn IntentTool>,
}

/// Registry of intents, scored by how many keywords a message contains.
#[derive(Default)]
pub struct IntentRouter {
    intents: Vec<Intent>,
}

impl IntentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an intent. Keywords are matched case-insensitively on word
    /// boundaries; multi-word keywords match as phrases.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        keywords: &[&str],
        tool: Arc<dyn IntentTool>,
    ) {
        let name = name.into();
        self.intents.retain(|i| i.name != name);
        self.intents.push(Intent {
            name,
            keywords: keywords.iter().map(|k| k.trim().to_lowercase()).collect(),
            tool,
        });
    }

    /// One `RouterTool` per configured intent, all sharing `runner`.
    pub fn from_configs(configs: &[IntentConfig], runner: Arc<dyn AiTaskRunner>) -> Self {
        let mut router = Self::new();
        for config in configs {
            if config.keywords.iter().all(|k| k.trim().is_empty()) {
                warn!(intent = %config.name, "Intent has no keywords, skipping");
                continue;
            }
            let mut tool = RouterTool::new(config.name.clone(), runner.clone());
            if let Some(ref prompt) = config.system_prompt {
                tool = tool.with_system_prompt(prompt.clone());
            }
            let keywords: Vec<&str> = config.keywords.iter().map(String::as_str).collect();
            router.register(config.name.clone(), &keywords, Arc::new(tool));
        }
        router
    }

    pub fn with_intent(
        mut self,
        name: impl Into<String>,
        keywords: &[&str],
        tool: Arc<dyn IntentTool>,
    ) -> Self {
        self.register(name, keywords, tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.intents.iter().map(|i| i.name.as_str()).collect()
    }

    /// Highest keyword score; ties go to the earlier registration.
    pub fn match_intent(&self, text: &str) -> Option<IntentMatch> {
        let padded = normalize(text);
        let mut best: Option<IntentMatch> = None;
        for intent in &self.intents {
            let matched: Vec<String> = intent
                .keywords
                .iter()
                .filter(|k| !k.is_empty() && padded.contains(&format!(" {} ", k)))
                .cloned()
                .collect();
            let score = matched.len();
            if score > 0 && best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(IntentMatch {
                    intent: intent.name.clone(),
                    score,
                    matched,
                });
            }
        }
        best
    }

    /// Run the matching intent's tool. `None` when no intent matches.
    pub async fn route(&self, message: &InboundMessage) -> Option<Result<(IntentMatch, IntentReply)>> {
        let found = self.match_intent(&message.text)?;
        let intent = self.intents.iter().find(|i| i.name == found.intent)?;
        debug!(intent = %found.intent, tool = intent.tool.name(), score = found.score, "Intent matched");

        let timeout = Duration::from_secs(intent.tool.timeout_secs());
        let reply = match tokio::time::timeout(timeout, intent.tool.execute(message)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(tool = intent.tool.name(), "Intent tool timed out");
                Err(FlowgateError::Pipeline(format!(
                    "tool '{}' timed out after {}s",
                    intent.tool.name(),
                    timeout.as_secs()
                )))
            }
        };
        Some(reply.map(|r| (found, r)))
    }
}

/// Lowercase, punctuation to spaces, padded so keywords match whole words.
fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    format!(" {} ", words.join(" "))
}

/// Sends the message to the AI task runner, optionally under a system prompt.
pub struct RouterTool {
    name: String,
    runner: Arc<dyn AiTaskRunner>,
    system_prompt: Option<String>,
}

impl RouterTool {
    pub fn new(name: impl Into<String>, runner: Arc<dyn AiTaskRunner>) -> Self {
        Self {
            name: name.into(),
            runner,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

impl IntentTool for RouterTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<IntentReply>> {
        Box::pin(async move {
            let mut request = ProviderRequest::task(message.user_id.clone(), message.text.clone());
            if let Some(ref prompt) = self.system_prompt {
                request.messages = vec![
                    ChatMessage::system(prompt.clone()),
                    ChatMessage::user(message.text.clone()),
                ];
            }
            let result = self.runner.run_task(request).await?;
            Ok(IntentReply {
                response: result.content.clone(),
                provider: Some(result),
            })
        })
    }
}
