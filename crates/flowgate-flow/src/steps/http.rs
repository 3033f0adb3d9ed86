use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowgate_core::flow::{ConfigMap, Node, StepKind};

use crate::result::{codes, NodeExecutionResult};
use crate::step::{config_u64, require_str, StepExecutor, StepInput};

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Outbound HTTP call. Timeouts, transport errors, 429 and 5xx are recoverable.
pub struct HttpRequestStep {
    client: reqwest::Client,
}

impl HttpRequestStep {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn request_timeout(config: &ConfigMap) -> Duration {
    Duration::from_millis(config_u64(config, "timeoutMs").unwrap_or(DEFAULT_HTTP_TIMEOUT_MS))
}

impl StepExecutor for HttpRequestStep {
    fn kind(&self) -> StepKind {
        StepKind::HttpRequest
    }

    fn validate(&self, node: &Node) -> Vec<String> {
        let mut errors = vec![];
        require_str(node, "url", &mut errors);
        if let Some(method) = node.config().get("method").and_then(|v| v.as_str()) {
            if !method.contains("{{") && method.to_uppercase().parse::<reqwest::Method>().is_err() {
                errors.push(format!("node '{}': invalid HTTP method '{}'", node.id, method));
            }
        }
        errors
    }

    fn timeout_hint(&self, config: &ConfigMap) -> Option<Duration> {
        // The request carries its own timeout; leave room for it to fire first.
        Some(request_timeout(config) + Duration::from_secs(1))
    }

    fn execute<'a>(&'a self, input: StepInput<'a>) -> BoxFuture<'a, NodeExecutionResult> {
        Box::pin(async move {
            let Some(url) = input.str("url") else {
                return NodeExecutionResult::failure("'url' is required", codes::VALIDATION);
            };
            let method = match input
                .str("method")
                .unwrap_or("GET")
                .to_uppercase()
                .parse::<reqwest::Method>()
            {
                Ok(m) => m,
                Err(e) => {
                    return NodeExecutionResult::failure(
                        format!("invalid method: {}", e),
                        codes::VALIDATION,
                    )
                }
            };

            let mut req = self
                .client
                .request(method.clone(), url)
                .timeout(request_timeout(&input.config));
            if let Some(Value::Object(headers)) = input.get("headers") {
                for (k, v) in headers {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    req = req.header(k.as_str(), value);
                }
            }
            match input.get("body") {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) => req = req.body(s.clone()),
                Some(other) => req = req.json(other),
            }

            debug!(node_id = %input.node.id, method = %method, url, "HTTP request");

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return NodeExecutionResult::recoverable_failure(
                        format!("request timed out: {}", e),
                        codes::TIMEOUT,
                    )
                }
                Err(e) if e.is_builder() => {
                    return NodeExecutionResult::failure(e.to_string(), codes::VALIDATION)
                }
                Err(e) => {
                    return NodeExecutionResult::recoverable_failure(e.to_string(), codes::NETWORK)
                }
            };

            let status = resp.status();
            let headers: serde_json::Map<String, Value> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.to_string(), Value::String(v.to_str().ok()?.to_string()))))
                .collect();
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_BODY_BYTES {
                let mut cut = MAX_BODY_BYTES;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            if status.is_success() {
                return NodeExecutionResult::success(json!({
                    "status": status.as_u16(),
                    "headers": headers,
                    "body": body,
                }));
            }

            let message = format!("HTTP {} from {}", status.as_u16(), url);
            if status.as_u16() == 429 || status.is_server_error() {
                NodeExecutionResult::recoverable_failure(message, codes::HTTP_ERROR)
            } else {
                NodeExecutionResult::failure(message, codes::HTTP_ERROR)
            }
        })
    }
}
