use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowgate_core::config::ProviderConfig;
use flowgate_core::traits::ProviderClient;
use flowgate_core::types::{
    ChatMessage, ProviderError, ProviderErrorKind, ProviderRequest, ProviderResponse, Role, Usage,
};

use super::presets::{build_extra_headers, get_preset, OPENAI_API_URL};

/// OpenAI-compatible chat-completions client. Works with OpenAI, Ollama,
/// Groq, OpenRouter and the other presets.
pub struct OpenAiCompatClient {
    name: String,
    http: Client,
    url: String,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
    config: ProviderConfig,
}

impl OpenAiCompatClient {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Self {
        let name = name.into();
        let preset = get_preset(&name);
        let url = config
            .base_url
            .clone()
            .or_else(|| preset.as_ref().map(|p| p.default_base_url.to_string()))
            .unwrap_or_else(|| OPENAI_API_URL.to_string());
        let headers = build_extra_headers(preset.as_ref(), &config.extra_headers);
        Self {
            name,
            http: Client::new(),
            url,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            headers,
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|m| OaiMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content,
        })
        .collect()
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else if e.is_connect() || e.is_request() {
        ProviderErrorKind::Network
    } else if e.is_builder() {
        ProviderErrorKind::InvalidRequest
    } else {
        ProviderErrorKind::Other
    };
    ProviderError::new(kind, e.to_string())
}

fn parse_response(body: &str) -> Result<ProviderResponse, ProviderError> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::new(ProviderErrorKind::Other, format!("malformed response: {}", e))
    })?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderError::new(ProviderErrorKind::Other, "response has no choices"))?;
    let usage = parsed
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    Ok(ProviderResponse { content, usage })
}

impl ProviderClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete<'a>(
        &'a self,
        model: &'a str,
        request: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResponse, ProviderError>> {
        Box::pin(async move {
            // o-series models reject temperature
            let is_o_series = model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4");
            let body = ChatRequest {
                model,
                messages: convert_messages(request.to_messages()),
                max_tokens: self.config.max_tokens,
                temperature: if !is_o_series && self.config.temperature > 0.0 {
                    Some(self.config.temperature)
                } else {
                    None
                },
                stream: false,
            };

            let mut req = self.http.post(&self.url).json(&body);
            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }

            debug!(provider = %self.name, model = %model, "Sending completion request");
            let response = req.send().await.map_err(transport_error)?;
            let status = response.status();
            let text = response.text().await.map_err(transport_error)?;
            if !status.is_success() {
                return Err(ProviderError::from_status(status.as_u16(), text));
            }
            parse_response(&text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_src: &str) -> ProviderConfig {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn test_url_resolution() {
        let groq = OpenAiCompatClient::new("groq", config(""));
        assert_eq!(groq.url(), "https://api.groq.com/openai/v1/chat/completions");

        let custom = OpenAiCompatClient::new("groq", config("base_url = \"http://proxy/v1/chat\""));
        assert_eq!(custom.url(), "http://proxy/v1/chat");

        let unknown = OpenAiCompatClient::new("inhouse", config(""));
        assert_eq!(unknown.url(), OPENAI_API_URL);
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi there"}}],
                       "usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let parsed = parse_response(body).unwrap();
        assert_eq!(parsed.content, "hi there");
        assert_eq!(parsed.usage.input_tokens, 12);
        assert_eq!(parsed.usage.output_tokens, 3);

        let err = parse_response(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Other);
    }

    #[test]
    fn test_status_mapping_is_structured() {
        assert!(ProviderError::from_status(429, "slow down").is_recoverable());
        assert!(ProviderError::from_status(503, "busy").is_recoverable());
        assert!(!ProviderError::from_status(401, "bad key").is_recoverable());
    }

    #[test]
    fn test_request_shape() {
        let body = ChatRequest {
            model: "o3-mini",
            messages: convert_messages(vec![ChatMessage::system("be brief"), ChatMessage::user("hi")]),
            max_tokens: 256,
            temperature: None,
            stream: false,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "hi");
        assert!(v.get("temperature").is_none());
    }
}
