use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info};

use flowgate_core::config::RouterConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::{AiTaskRunner, ProviderClient};
use flowgate_core::types::{
    FailoverChainEntry, ProviderRequest, ProviderResult, Role, TaskClassification, TaskTier,
};

use crate::chain::get_chain;
use crate::classifier::{ClassifyContext, TaskClassifier};
use crate::failover::FailoverExecutor;

/// Classification, chain resolution and failover behind one call.
pub struct TaskRouter {
    classifier: TaskClassifier,
    failover: FailoverExecutor,
    config: RouterConfig,
}

impl TaskRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            classifier: TaskClassifier::new(),
            failover: FailoverExecutor::new(Duration::from_millis(config.attempt_timeout_ms)),
            config,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.failover.register(client);
        self
    }

    pub fn with_clients(mut self, clients: impl IntoIterator<Item = Arc<dyn ProviderClient>>) -> Self {
        for client in clients {
            self.failover.register(client);
        }
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn classifier(&self) -> &TaskClassifier {
        &self.classifier
    }

    /// Classify the request, or honor `force_tier`.
    pub fn classify(&self, request: &ProviderRequest) -> TaskClassification {
        if let Some(tier) = request.force_tier {
            return TaskClassification {
                tier,
                confidence: 1.0,
                reasons: vec!["forced tier".to_string()],
            };
        }
        let history_len = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .count()
            .saturating_sub(1);
        self.classifier.classify(
            &request.description(),
            &ClassifyContext {
                history_len,
                has_attachments: false,
            },
        )
    }

    /// Chain for a tier, narrowed to `force_provider` when set.
    pub fn chain_for(&self, tier: TaskTier, force_provider: Option<&str>) -> Result<Vec<FailoverChainEntry>> {
        let chain = get_chain(tier, &self.config);
        let Some(provider) = force_provider else {
            return Ok(chain);
        };

        let forced: Vec<FailoverChainEntry> =
            chain.into_iter().filter(|e| e.provider == provider).collect();
        if !forced.is_empty() {
            return Ok(forced);
        }
        // Borrow the provider's model from the nearest tier that names it.
        let mut tiers: Vec<TaskTier> = TaskTier::ALL.to_vec();
        tiers.sort_by_key(|t| t.rank().abs_diff(tier.rank()));
        tiers
            .into_iter()
            .flat_map(|t| get_chain(t, &self.config))
            .find(|e| e.provider == provider)
            .map(|e| vec![FailoverChainEntry::primary(e.provider, e.model)])
            .ok_or_else(|| FlowgateError::ProviderNotConfigured(provider.to_string()))
    }

    /// Classify and execute, returning both.
    pub async fn route(&self, request: &ProviderRequest) -> Result<(TaskClassification, ProviderResult)> {
        let classification = self.classify(request);
        let chain = self.chain_for(classification.tier, request.force_provider.as_deref())?;
        debug!(
            user_id = %request.user_id,
            tier = %classification.tier,
            chain = %chain.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(","),
            "Routing task"
        );
        let result = self
            .failover
            .execute_with_failover(&chain, request, classification.tier)
            .await?;
        info!(
            user_id = %request.user_id,
            tier = %result.tier,
            provider = %result.provider,
            model = %result.model,
            attempts = result.attempts.len(),
            "Task routed"
        );
        Ok((classification, result))
    }
}

impl AiTaskRunner for TaskRouter {
    fn run_task(&self, request: ProviderRequest) -> BoxFuture<'_, Result<ProviderResult>> {
        Box::pin(async move { self.route(&request).await.map(|(_, result)| result) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::config::TierModelConfig;
    use flowgate_core::types::ProviderErrorKind;
    use flowgate_test_utils::ScriptedProvider;

    fn config() -> RouterConfig {
        let mut config = RouterConfig::default();
        config.chains.insert(
            TaskTier::Trivial,
            vec![FailoverChainEntry::primary("cheap", "small")],
        );
        config.chains.insert(
            TaskTier::Critical,
            vec![
                FailoverChainEntry::primary("big", "large"),
                FailoverChainEntry::new("cheap", "medium"),
            ],
        );
        config
    }

    #[tokio::test]
    async fn test_routes_by_classified_tier() {
        let cheap = Arc::new(ScriptedProvider::ok("cheap", "hello!"));
        let big = Arc::new(ScriptedProvider::ok("big", "on it"));
        let router = TaskRouter::new(config()).with_client(cheap.clone()).with_client(big.clone());

        let result = router.run_task(ProviderRequest::task("u", "hi")).await.unwrap();
        assert_eq!(result.provider, "cheap");
        assert_eq!(result.tier, TaskTier::Trivial);
        assert_eq!(big.calls(), 0);

        let (class, result) = router
            .route(&ProviderRequest::task("u", "production outage in the payments service"))
            .await
            .unwrap();
        assert_eq!(class.tier, TaskTier::Critical);
        assert_eq!(result.provider, "big");
    }

    #[tokio::test]
    async fn test_force_tier_and_provider() {
        let cheap = Arc::new(ScriptedProvider::ok("cheap", "x"));
        let big = Arc::new(ScriptedProvider::ok("big", "y"));
        let router = TaskRouter::new(config()).with_clients([
            cheap.clone() as Arc<dyn ProviderClient>,
            big.clone() as Arc<dyn ProviderClient>,
        ]);

        let mut req = ProviderRequest::task("u", "hi");
        req.force_tier = Some(TaskTier::Critical);
        req.force_provider = Some("cheap".into());
        let (class, result) = router.route(&req).await.unwrap();
        assert_eq!(class.confidence, 1.0);
        assert_eq!(result.provider, "cheap");
        assert_eq!(result.model, "medium");
        assert_eq!(cheap.models(), vec!["medium"]);
    }

    #[test]
    fn test_forced_provider_borrows_nearest_tier() {
        let mut cfg = config();
        cfg.tiers.insert(
            TaskTier::Moderate,
            TierModelConfig {
                provider: "local".into(),
                model: "llama".into(),
            },
        );
        let router = TaskRouter::new(cfg);
        let chain = router.chain_for(TaskTier::Simple, Some("local")).unwrap();
        assert_eq!(chain, vec![FailoverChainEntry::primary("local", "llama")]);

        let err = router.chain_for(TaskTier::Simple, Some("nobody")).unwrap_err();
        assert!(matches!(err, FlowgateError::ProviderNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_as_error() {
        let router = TaskRouter::new(config())
            .with_client(Arc::new(ScriptedProvider::failing("cheap", ProviderErrorKind::ServerError)));
        let err = router.run_task(ProviderRequest::task("u", "hi")).await.unwrap_err();
        assert!(matches!(err, FlowgateError::ChainExhausted { .. }));
    }
}
