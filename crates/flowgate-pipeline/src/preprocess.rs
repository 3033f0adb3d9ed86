use regex::Regex;

use flowgate_core::config::PreprocessConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::InboundMessage;

/// Tier-0 verdict for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Drop silently.
    Skip(String),
    /// Hand to background ingestion and return immediately.
    Passive(String),
    Active,
}

pub struct Preprocessor {
    config: PreprocessConfig,
    passive_patterns: Vec<Regex>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        let passive_patterns = config
            .passive_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    FlowgateError::Config(format!("invalid passive pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            passive_patterns,
        })
    }

    pub fn classify(&self, message: &InboundMessage) -> Disposition {
        let text = message.text.trim();
        if text.is_empty() {
            return Disposition::Skip("empty message".into());
        }
        if text.chars().count() < self.config.min_length {
            return Disposition::Skip(format!("shorter than {} characters", self.config.min_length));
        }
        if message.is_bot() {
            return Disposition::Skip("bot sender".into());
        }
        if self
            .config
            .skip_senders
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&message.sender))
        {
            return Disposition::Skip(format!("sender '{}' is ignored", message.sender));
        }
        if self.config.passive_channels.iter().any(|c| c == &message.channel) {
            return Disposition::Passive(format!("passive channel '{}'", message.channel));
        }
        if let Some(pattern) = self.passive_patterns.iter().find(|p| p.is_match(text)) {
            return Disposition::Passive(format!("matches passive pattern '{}'", pattern.as_str()));
        }
        Disposition::Active
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            config: PreprocessConfig::default(),
            passive_patterns: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(PreprocessConfig {
            skip_senders: vec!["noreply".into()],
            passive_channels: vec!["feed".into()],
            passive_patterns: vec![r"^\[digest\]".into()],
            min_length: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_rules_in_order() {
        let p = preprocessor();
        let cases = [
            (InboundMessage::new("chat", "ann", "   "), "skip"),
            (InboundMessage::new("chat", "ann", "k"), "skip"),
            (InboundMessage::new("chat", "NoReply", "your invoice"), "skip"),
            (InboundMessage::new("chat", "bot", "beep").with_metadata("is_bot", json!(true)), "skip"),
            (InboundMessage::new("feed", "ann", "release notes"), "passive"),
            (InboundMessage::new("chat", "ann", "[digest] weekly"), "passive"),
            (InboundMessage::new("chat", "ann", "can you help?"), "active"),
        ];
        for (msg, expected) in cases {
            let got = match p.classify(&msg) {
                Disposition::Skip(_) => "skip",
                Disposition::Passive(_) => "passive",
                Disposition::Active => "active",
            };
            assert_eq!(got, expected, "{:?}", msg.text);
        }
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let err = Preprocessor::new(PreprocessConfig {
            passive_patterns: vec!["(".into()],
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, FlowgateError::Config(_)));
    }
}
