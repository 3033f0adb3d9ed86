//! Deterministic task difficulty classification.
//!
//! Rules are a static keyword table plus length and context signals. The same
//! input always produces the same classification.

use flowgate_core::types::{TaskClassification, TaskTier};

/// Extra signals beyond the task text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext {
    /// Prior turns in the conversation.
    pub history_len: usize,
    pub has_attachments: bool,
}

struct KeywordRule {
    tier: TaskTier,
    phrases: &'static [&'static str],
    reason: &'static str,
}

const RULES: &[KeywordRule] = &[
    KeywordRule {
        tier: TaskTier::Critical,
        phrases: &[
            "production", "outage", "security", "vulnerability", "breach", "incident",
            "legal", "compliance", "medical", "data loss",
        ],
        reason: "high-stakes domain",
    },
    KeywordRule {
        tier: TaskTier::Complex,
        phrases: &[
            "analyze", "analyse", "architecture", "design", "debug", "refactor", "optimize",
            "implement", "algorithm", "strategy", "research", "prove",
        ],
        reason: "multi-step reasoning",
    },
    KeywordRule {
        tier: TaskTier::Moderate,
        phrases: &[
            "explain", "compare", "summarize", "summarise", "draft", "write", "review",
            "plan", "translate", "rewrite",
        ],
        reason: "generation or explanation",
    },
    KeywordRule {
        tier: TaskTier::Simple,
        phrases: &["what is", "who is", "when is", "define", "list", "convert", "lookup", "look up"],
        reason: "factual lookup",
    },
];

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "ok", "okay", "yes", "no", "ping", "good morning",
];

/// Classifies task descriptions into difficulty tiers.
#[derive(Debug, Clone)]
pub struct TaskClassifier {
    /// Conversations at least this long are bumped one tier.
    long_history: usize,
}

impl Default for TaskClassifier {
    fn default() -> Self {
        Self { long_history: 10 }
    }
}

impl TaskClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, description: &str, context: &ClassifyContext) -> TaskClassification {
        let normalized = normalize(description);
        let words = normalized.split_whitespace().count();
        let mut reasons = vec![];
        let mut signals = 0usize;

        let length_tier = match words {
            0..=3 => TaskTier::Trivial,
            4..=12 => TaskTier::Simple,
            13..=40 => TaskTier::Moderate,
            _ => TaskTier::Complex,
        };

        let keyword = RULES
            .iter()
            .find(|rule| rule.phrases.iter().any(|p| contains_phrase(&normalized, p)));

        let mut tier = match keyword {
            Some(rule) => {
                signals += 1;
                reasons.push(format!("{} keyword", rule.reason));
                rule.tier.max(length_tier.min(TaskTier::Moderate))
            }
            None if words <= 6 && GREETINGS.iter().any(|g| contains_phrase(&normalized, g)) => {
                signals += 1;
                reasons.push("greeting or acknowledgement".to_string());
                TaskTier::Trivial
            }
            None => {
                reasons.push(format!("{} words", words));
                length_tier
            }
        };

        if description.contains("```") {
            signals += 1;
            reasons.push("contains code block".to_string());
            tier = tier.max(TaskTier::Moderate);
        }
        if context.has_attachments {
            signals += 1;
            reasons.push("has attachments".to_string());
            tier = tier.max(TaskTier::Moderate);
        }
        if context.history_len >= self.long_history && tier < TaskTier::Complex {
            signals += 1;
            reasons.push(format!("long conversation ({} turns)", context.history_len));
            tier = TaskTier::from_rank(tier.rank() + 1);
        }

        let base = if signals > 0 { 0.6 } else { 0.5 };
        let confidence = (base + 0.1 * signals.saturating_sub(1) as f64).min(0.95);

        TaskClassification {
            tier,
            confidence,
            reasons,
        }
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-word (or whole-phrase) match against normalized text.
fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    let padded = format!(" {} ", normalized);
    padded.contains(&format!(" {} ", phrase))
}
