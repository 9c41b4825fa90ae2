use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::{Config, parse_duration};
use crate::error::{EngineError, ProviderError};
use crate::llm::{CompletionRequest, LlmClient, OpenAiCompatible};
use crate::models::{Provider, ProviderTestResult};

struct ProviderEntry {
    provider: Provider,
    client: Arc<dyn LlmClient>,
    test_timeout: Duration,
}

/// A provider chosen to serve a request, with the model to use by default.
#[derive(Clone)]
pub struct PoolMember {
    pub name: String,
    pub model: String,
    pub client: Arc<dyn LlmClient>,
}

impl std::fmt::Debug for PoolMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMember")
            .field("name", &self.name)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// The configured providers, in configuration order.
///
/// The lock is held only for short, non-async critical sections.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<Vec<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new();
        for provider_config in &config.provider {
            let api_key = provider_config.resolve_api_key();
            let timeout = parse_duration("provider timeout", &provider_config.timeout)?;
            let test_timeout = parse_duration("provider test_timeout", &provider_config.test_timeout)?;
            let configured = api_key.is_some();
            if !configured {
                warn!(provider = %provider_config.name, "no API key configured; provider stays out of rotation");
            }

            let client = OpenAiCompatible::new(&provider_config.name, &provider_config.base_url, api_key, timeout)?;
            registry.register(
                Provider {
                    name: provider_config.name.clone(),
                    display_name: provider_config
                        .display_name
                        .clone()
                        .unwrap_or_else(|| provider_config.name.clone()),
                    default_model: provider_config.default_model.clone(),
                    configured,
                    available: configured,
                    enabled: provider_config.enabled,
                },
                Arc::new(client),
                test_timeout,
            );
        }
        info!(count = config.provider.len(), "providers registered");
        Ok(registry)
    }

    /// Append a provider; registration order is the rotation order.
    pub fn register(&self, provider: Provider, client: Arc<dyn LlmClient>, test_timeout: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(ProviderEntry {
            provider,
            client,
            test_timeout,
        });
    }

    pub fn list(&self) -> Vec<Provider> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|e| e.provider.clone()).collect()
    }

    /// Enabled and available providers, in configuration order.
    pub fn pool(&self) -> Vec<PoolMember> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.provider.enabled && e.provider.available)
            .map(|e| PoolMember {
                name: e.provider.name.clone(),
                model: e.provider.default_model.clone(),
                client: e.client.clone(),
            })
            .collect()
    }

    /// Resolve an explicitly requested provider, bypassing rotation.
    pub fn get(&self, name: &str) -> Result<PoolMember, EngineError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .iter()
            .find(|e| e.provider.name == name)
            .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))?;
        if !entry.provider.configured {
            return Err(EngineError::ProviderNotConfigured(name.to_string()));
        }
        if !entry.provider.enabled {
            return Err(EngineError::ProviderDisabled(name.to_string()));
        }
        Ok(PoolMember {
            name: entry.provider.name.clone(),
            model: entry.provider.default_model.clone(),
            client: entry.client.clone(),
        })
    }

    /// One lightweight round-trip. Does not touch `available`; see [`Self::apply_test_result`].
    pub async fn test_provider(&self, name: &str) -> Result<ProviderTestResult, EngineError> {
        let (client, model, configured, test_timeout) = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let entry = entries
                .iter()
                .find(|e| e.provider.name == name)
                .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))?;
            (
                entry.client.clone(),
                entry.provider.default_model.clone(),
                entry.provider.configured,
                entry.test_timeout,
            )
        };

        if !configured {
            return Err(EngineError::ProviderNotConfigured(name.to_string()));
        }

        let request = CompletionRequest {
            model: model.clone(),
            system: None,
            prompt: "ping".to_string(),
            max_tokens: Some(8),
        };

        info!(provider = %name, model = %model, "testing provider");

        let outcome = match tokio::time::timeout(test_timeout, client.complete(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(EngineError::ProviderUnreachable {
                    provider: name.to_string(),
                    message: format!("no response within {test_timeout:?}"),
                });
            }
        };

        match outcome {
            Ok(completion) => Ok(ProviderTestResult {
                available: true,
                model,
                token_usage: completion.token_usage,
                error: None,
            }),
            Err(ProviderError::NotConfigured(_)) => Err(EngineError::ProviderNotConfigured(name.to_string())),
            Err(e @ (ProviderError::Timeout { .. } | ProviderError::Unreachable { .. })) => {
                Err(EngineError::ProviderUnreachable {
                    provider: name.to_string(),
                    message: e.to_string(),
                })
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "provider test failed");
                Ok(ProviderTestResult {
                    available: false,
                    model,
                    token_usage: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    pub fn apply_test_result(&self, name: &str, result: &ProviderTestResult) -> Result<(), EngineError> {
        self.update(name, |provider| provider.available = result.available)
    }

    pub fn set_available(&self, name: &str, available: bool) -> Result<(), EngineError> {
        self.update(name, |provider| provider.available = available)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError> {
        self.update(name, |provider| provider.enabled = enabled)
    }

    pub fn set_default_model(&self, name: &str, model: &str) -> Result<(), EngineError> {
        self.update(name, |provider| provider.default_model = model.to_string())
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut Provider)) -> Result<(), EngineError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .iter_mut()
            .find(|e| e.provider.name == name)
            .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))?;
        apply(&mut entry.provider);
        info!(
            provider = %name,
            enabled = entry.provider.enabled,
            available = entry.provider.available,
            model = %entry.provider.default_model,
            "provider updated"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use super::ProviderRegistry;
    use crate::llm::testing::ScriptedClient;
    use crate::models::Provider;

    pub(crate) fn provider(name: &str) -> Provider {
        Provider {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            default_model: format!("{name}-model"),
            configured: true,
            available: true,
            enabled: true,
        }
    }

    pub(crate) fn registry_with(clients: Vec<(&str, Arc<ScriptedClient>)>) -> Arc<ProviderRegistry> {
        let registry = ProviderRegistry::new();
        for (name, client) in clients {
            registry.register(provider(name), client, Duration::from_secs(1));
        }
        Arc::new(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{provider, registry_with};
    use super::*;
    use crate::llm::testing::{Reply, ScriptedClient, chunks, timeout};

    #[test]
    fn list_keeps_configuration_order() {
        let registry = registry_with(vec![
            ("b", ScriptedClient::new(vec![])),
            ("a", ScriptedClient::new(vec![])),
            ("c", ScriptedClient::new(vec![])),
        ]);
        let names: Vec<_> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn pool_excludes_disabled_and_unavailable() {
        let registry = registry_with(vec![
            ("a", ScriptedClient::new(vec![])),
            ("b", ScriptedClient::new(vec![])),
            ("c", ScriptedClient::new(vec![])),
        ]);
        registry.set_enabled("a", false).unwrap();
        registry.set_available("c", false).unwrap();
        let pool: Vec<_> = registry.pool().into_iter().map(|m| m.name).collect();
        assert_eq!(pool, ["b"]);
    }

    #[test]
    fn mutations_do_not_touch_other_providers() {
        let registry = registry_with(vec![("a", ScriptedClient::new(vec![])), ("b", ScriptedClient::new(vec![]))]);
        registry.set_default_model("a", "a-large").unwrap();
        let providers = registry.list();
        assert_eq!(providers[0].default_model, "a-large");
        assert_eq!(providers[1], provider("b"));
        assert!(matches!(
            registry.set_enabled("zzz", true),
            Err(EngineError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_result_is_applied_only_on_request() {
        let client = ScriptedClient::new(vec![Reply::Fail(ProviderError::Auth {
            provider: "a".into(),
            message: "invalid key".into(),
        })]);
        let registry = registry_with(vec![("a", client)]);

        let result = registry.test_provider("a").await.unwrap();
        assert!(!result.available);
        assert!(result.error.unwrap().contains("invalid key"));
        assert!(registry.list()[0].available, "test must not mutate availability");

        let result = ProviderTestResult {
            available: false,
            model: "a-model".into(),
            token_usage: None,
            error: None,
        };
        registry.apply_test_result("a", &result).unwrap();
        assert!(!registry.list()[0].available);
    }

    #[tokio::test]
    async fn test_reports_usage_on_success() {
        let registry = registry_with(vec![("a", ScriptedClient::new(vec![chunks(&["po", "ng"])]))]);
        let result = registry.test_provider("a").await.unwrap();
        assert!(result.available);
        assert_eq!(result.model, "a-model");
        assert_eq!(result.token_usage, Some(2));
    }

    #[tokio::test]
    async fn test_classifies_unreachable_and_unconfigured() {
        let registry = registry_with(vec![("a", ScriptedClient::new(vec![Reply::Fail(timeout("a"))]))]);
        assert!(matches!(
            registry.test_provider("a").await,
            Err(EngineError::ProviderUnreachable { .. })
        ));

        let unconfigured = ProviderRegistry::new();
        let mut p = provider("x");
        p.configured = false;
        unconfigured.register(p, ScriptedClient::new(vec![]), Duration::from_secs(1));
        assert!(matches!(
            unconfigured.test_provider("x").await,
            Err(EngineError::ProviderNotConfigured(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_as_unreachable() {
        let registry = registry_with(vec![("a", ScriptedClient::new(vec![Reply::Stall]))]);
        assert!(matches!(
            registry.test_provider("a").await,
            Err(EngineError::ProviderUnreachable { .. })
        ));
    }

    #[test]
    fn get_checks_override_eligibility() {
        let registry = registry_with(vec![("a", ScriptedClient::new(vec![]))]);
        assert_eq!(registry.get("a").unwrap().model, "a-model");
        registry.set_enabled("a", false).unwrap();
        assert!(matches!(registry.get("a"), Err(EngineError::ProviderDisabled(_))));
        assert!(matches!(registry.get("nope"), Err(EngineError::UnknownProvider(_))));
    }
}
