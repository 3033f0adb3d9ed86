use std::collections::HashMap;

/// Defaults for a named OpenAI-compatible API.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    let (url, needs_api_key, extra_headers): (&'static str, bool, &'static [(&'static str, &'static str)]) =
        match provider {
            "openai" => (OPENAI_API_URL, true, &[]),
            "ollama" => ("http://localhost:11434/v1/chat/completions", false, &[]),
            "groq" => ("https://api.groq.com/openai/v1/chat/completions", true, &[]),
            "openrouter" => (
                "https://openrouter.ai/api/v1/chat/completions",
                true,
                &[("X-Title", "Flowgate")],
            ),
            "together" => ("https://api.together.xyz/v1/chat/completions", true, &[]),
            "mistral" => ("https://api.mistral.ai/v1/chat/completions", true, &[]),
            "deepseek" => ("https://api.deepseek.com/v1/chat/completions", true, &[]),
            _ => return None,
        };
    Some(ProviderPreset {
        default_base_url: url,
        needs_api_key,
        extra_headers,
    })
}

/// Preset headers, with user headers overriding by name.
pub fn build_extra_headers(
    preset: Option<&ProviderPreset>,
    user_headers: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = preset
        .map(|p| p.extra_headers)
        .unwrap_or_default()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let mut overrides: Vec<(&String, &String)> = user_headers.iter().collect();
    overrides.sort();
    for (k, v) in overrides {
        if let Some(pos) = headers.iter().position(|(hk, _)| hk.eq_ignore_ascii_case(k)) {
            headers[pos].1 = v.clone();
        } else {
            headers.push((k.clone(), v.clone()));
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_headers_override_preset() {
        let preset = get_preset("openrouter");
        let mut user = HashMap::new();
        user.insert("x-title".to_string(), "Ops".to_string());
        user.insert("X-Team".to_string(), "sre".to_string());
        let headers = build_extra_headers(preset.as_ref(), &user);
        assert_eq!(
            headers,
            vec![
                ("X-Title".to_string(), "Ops".to_string()),
                ("X-Team".to_string(), "sre".to_string()),
            ]
        );
    }

    #[test]
    fn test_unknown_preset() {
        assert!(get_preset("nope").is_none());
        assert!(!get_preset("ollama").unwrap().needs_api_key);
    }
}
