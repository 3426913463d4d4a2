//! Provider router — selects the LLM provider a config snapshot asks for.
//!
//! Providers are built from the catalog on first use and cached, keyed by
//! provider, endpoint and key, so switching provider mid-session builds a
//! new client while repeated turns reuse the old one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use termagent_config::AppConfig;
use termagent_core::error::ProviderError;
use termagent_core::provider::Provider;
use tracing::debug;

use crate::openai_compat::OpenAiCompatProvider;

/// Routes LLM requests to the correct provider.
#[derive(Default)]
pub struct ProviderRouter {
    /// Explicitly registered providers, by provider id
    registered: HashMap<String, Arc<dyn Provider>>,
    built: Mutex<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under a catalog id; it takes precedence over
    /// the catalog-built client for that id.
    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.registered.insert(id.into(), provider);
    }

    /// The provider a configuration snapshot selects.
    pub fn resolve(&self, config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(provider) = self.registered.get(&config.provider) {
            return Ok(Arc::clone(provider));
        }

        let spec = config
            .provider_spec()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;
        let base_url = config
            .resolved_base_url()
            .unwrap_or_else(|| spec.base_url.to_string());
        let api_key = config.resolve_api_key().ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "no API key for '{}': set {} or API_KEY",
                spec.id, spec.env_key
            ))
        })?;

        let cache_key = format!("{}\u{0}{base_url}\u{0}{api_key}", spec.id);
        let mut built = self.built.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(provider) = built.get(&cache_key) {
            return Ok(Arc::clone(provider));
        }

        debug!(provider = spec.id, base_url = %base_url, "Building provider client");
        let provider: Arc<dyn Provider> = Arc::new(
            OpenAiCompatProvider::new(spec.id, &base_url, api_key)?
                .with_capabilities(spec.capabilities),
        );
        built.insert(cache_key, Arc::clone(&provider));
        Ok(provider)
    }

    /// Ids of explicitly registered providers.
    pub fn registered(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.registered.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
