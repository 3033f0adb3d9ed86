pub mod openai;
pub mod presets;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use flowgate_core::config::ProviderConfig;
use flowgate_core::traits::ProviderClient;

pub use openai::OpenAiCompatClient;

/// Create provider clients from config, keyed by provider name.
pub fn build_clients(configs: &HashMap<String, ProviderConfig>) -> Vec<Arc<dyn ProviderClient>> {
    let mut names: Vec<&String> = configs.keys().collect();
    names.sort();

    let mut clients: Vec<Arc<dyn ProviderClient>> = Vec::with_capacity(names.len());
    for name in names {
        let config = &configs[name];
        match config.kind.as_str() {
            // Everything currently speaks the OpenAI chat-completions dialect.
            "openai" | "openai-compatible" => {
                clients.push(Arc::new(OpenAiCompatClient::new(name, config.clone())));
            }
            other => warn!(provider = %name, kind = %other, "Unsupported provider kind, skipping"),
        }
    }
    clients
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(kind: &str) -> ProviderConfig {
        toml::from_str::<ProviderConfig>(&format!("kind = \"{}\"", kind)).unwrap()
    }

    #[test]
    fn test_build_clients_skips_unknown_kinds() {
        let mut configs = HashMap::new();
        configs.insert("groq".to_string(), provider("openai"));
        configs.insert("local".to_string(), provider("openai-compatible"));
        configs.insert("weird".to_string(), provider("carrier-pigeon"));
        let clients = build_clients(&configs);
        let names: Vec<&str> = clients.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["groq", "local"]);
    }
}
