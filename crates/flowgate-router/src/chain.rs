use flowgate_core::config::RouterConfig;
use flowgate_core::types::{FailoverChainEntry, TaskTier};

/// Built-in chain for a tier, used when nothing is configured.
pub fn default_chain(tier: TaskTier) -> Vec<FailoverChainEntry> {
    match tier {
        TaskTier::Trivial | TaskTier::Simple => vec![
            FailoverChainEntry::primary("openai", "gpt-4o-mini"),
            FailoverChainEntry::new("groq", "llama-3.1-8b-instant"),
        ],
        TaskTier::Moderate => vec![
            FailoverChainEntry::primary("openai", "gpt-4o-mini"),
            FailoverChainEntry::new("openai", "gpt-4o"),
            FailoverChainEntry::new("groq", "llama-3.3-70b-versatile"),
        ],
        TaskTier::Complex => vec![
            FailoverChainEntry::primary("openai", "gpt-4o"),
            FailoverChainEntry::new("openrouter", "anthropic/claude-3.5-sonnet"),
            FailoverChainEntry::new("deepseek", "deepseek-chat"),
        ],
        TaskTier::Critical => vec![
            FailoverChainEntry::primary("openai", "gpt-4o"),
            FailoverChainEntry::new("openrouter", "anthropic/claude-3.5-sonnet"),
        ],
    }
}

/// Failover chain for `tier`.
///
/// A custom chain wins over the legacy single-provider setting, which wins
/// over the built-in default. Custom entries keep their authored order except
/// that the first `is_primary` entry is moved to the front.
pub fn get_chain(tier: TaskTier, config: &RouterConfig) -> Vec<FailoverChainEntry> {
    if let Some(custom) = config.chains.get(&tier).filter(|c| !c.is_empty()) {
        let mut chain = custom.clone();
        if let Some(pos) = chain.iter().position(|e| e.is_primary) {
            let primary = chain.remove(pos);
            chain.insert(0, primary);
        }
        return chain;
    }

    if let Some(legacy) = config.tiers.get(&tier) {
        return vec![FailoverChainEntry::primary(
            legacy.provider.clone(),
            legacy.model.clone(),
        )];
    }

    default_chain(tier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::config::TierModelConfig;

    #[test]
    fn test_custom_chain_beats_legacy() {
        let mut config = RouterConfig::default();
        config.tiers.insert(
            TaskTier::Simple,
            TierModelConfig {
                provider: "legacy".into(),
                model: "m0".into(),
            },
        );
        config.chains.insert(
            TaskTier::Simple,
            vec![
                FailoverChainEntry::new("a", "m1"),
                FailoverChainEntry::new("b", "m2"),
            ],
        );
        let chain = get_chain(TaskTier::Simple, &config);
        assert_eq!(chain.iter().map(|e| e.provider.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_primary_moves_first() {
        let mut config = RouterConfig::default();
        config.chains.insert(
            TaskTier::Complex,
            vec![
                FailoverChainEntry::new("a", "m1"),
                FailoverChainEntry::new("b", "m2"),
                FailoverChainEntry::primary("c", "m3"),
                FailoverChainEntry::primary("d", "m4"),
            ],
        );
        let chain = get_chain(TaskTier::Complex, &config);
        let order: Vec<_> = chain.iter().map(|e| e.provider.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn test_legacy_then_default() {
        let mut config = RouterConfig::default();
        config.tiers.insert(
            TaskTier::Trivial,
            TierModelConfig {
                provider: "ollama".into(),
                model: "llama3".into(),
            },
        );
        // An empty custom chain does not shadow the legacy setting.
        config.chains.insert(TaskTier::Trivial, vec![]);
        let chain = get_chain(TaskTier::Trivial, &config);
        assert_eq!(chain, vec![FailoverChainEntry::primary("ollama", "llama3")]);

        for tier in TaskTier::ALL {
            assert!(!get_chain(tier, &RouterConfig::default()).is_empty());
        }
    }
}
