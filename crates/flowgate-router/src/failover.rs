use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::ProviderClient;
use flowgate_core::types::{
    FailoverChainEntry, ProviderAttempt, ProviderError, ProviderErrorKind, ProviderRequest,
    ProviderResult, TaskTier,
};

/// Runs a request down a failover chain, one attempt per entry.
pub struct FailoverExecutor {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
    attempt_timeout: Duration,
}

impl FailoverExecutor {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            attempt_timeout,
        }
    }

    /// Register a client under its own `name()`.
    pub fn with_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.register(client);
        self
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.name().to_string(), client);
    }

    pub fn has_client(&self, provider: &str) -> bool {
        self.clients.contains_key(provider)
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Try each entry strictly in order; the first success wins.
    ///
    /// Every failure advances to the next entry, recoverable or not. No entry
    /// is attempted twice within one call.
    pub async fn execute_with_failover(
        &self,
        chain: &[FailoverChainEntry],
        request: &ProviderRequest,
        tier: TaskTier,
    ) -> Result<ProviderResult> {
        if chain.is_empty() {
            return Err(FlowgateError::EmptyChain(tier.to_string()));
        }

        let mut attempts: Vec<ProviderAttempt> = Vec::with_capacity(chain.len());
        for (index, entry) in chain.iter().enumerate() {
            let started = Instant::now();
            let outcome = match self.clients.get(&entry.provider) {
                Some(client) => {
                    match tokio::time::timeout(self.attempt_timeout, client.complete(&entry.model, request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::new(
                            ProviderErrorKind::Timeout,
                            format!("no response within {}ms", self.attempt_timeout.as_millis()),
                        )),
                    }
                }
                None => Err(ProviderError::new(
                    ProviderErrorKind::Other,
                    format!("provider '{}' is not configured", entry.provider),
                )),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => {
                    attempts.push(ProviderAttempt {
                        provider: entry.provider.clone(),
                        model: entry.model.clone(),
                        succeeded: true,
                        error: None,
                        elapsed_ms,
                    });
                    if index > 0 {
                        info!(
                            provider = %entry.provider,
                            model = %entry.model,
                            attempt = index + 1,
                            "Fell back to alternative provider"
                        );
                    }
                    return Ok(ProviderResult {
                        content: response.content,
                        model: entry.model.clone(),
                        provider: entry.provider.clone(),
                        tier,
                        usage: response.usage,
                        attempts,
                    });
                }
                Err(error) => {
                    warn!(
                        provider = %entry.provider,
                        model = %entry.model,
                        attempt = index + 1,
                        chain_len = chain.len(),
                        recoverable = error.is_recoverable(),
                        error = %error,
                        "Provider attempt failed"
                    );
                    attempts.push(ProviderAttempt {
                        provider: entry.provider.clone(),
                        model: entry.model.clone(),
                        succeeded: false,
                        error: Some(error),
                        elapsed_ms,
                    });
                }
            }
        }

        Err(FlowgateError::ChainExhausted {
            attempts: attempts
                .iter()
                .map(|a| {
                    let reason = a.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
                    format!("{}/{}: {}", a.provider, a.model, reason)
                })
                .collect(),
        })
    }
}
