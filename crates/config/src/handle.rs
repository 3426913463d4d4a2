//! Shared, atomically replaced configuration snapshots.

use std::sync::{Arc, RwLock};

use crate::{AppConfig, ConfigError};

/// Holds the current configuration snapshot.
///
/// Readers take an `Arc<AppConfig>` and keep using it for as long as they
/// like; writers build a complete new config and swap it in whole. A turn
/// in progress never sees a half-applied change.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<AppConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<AppConfig> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Validate and publish a replacement snapshot.
    pub fn publish(&self, config: AppConfig) -> Result<Arc<AppConfig>, ConfigError> {
        config.validate()?;
        let next = Arc::new(config);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&next);
        tracing::debug!(provider = %next.provider, model = %next.model_name(), "Published config snapshot");
        Ok(next)
    }

    /// Derive a new snapshot from the current one and publish it.
    ///
    /// The edit runs under the write lock so concurrent updates compose.
    /// Nothing is published if validation fails.
    pub fn update<F>(&self, edit: F) -> Result<Arc<AppConfig>, ConfigError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut draft = AppConfig::clone(&guard);
        edit(&mut draft);
        draft.validate()?;
        let next = Arc::new(draft);
        *guard = Arc::clone(&next);
        tracing::debug!(provider = %next.provider, model = %next.model_name(), "Updated config snapshot");
        Ok(next)
    }
}
