//! Provider id -> adapter lookup.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapter::ChatAdapter;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No adapter registered for provider '{provider_id}'")]
    AdapterNotFound { provider_id: String },
}

/// Maps provider ids to adapters. Lookups distinguish "no provider
/// configured" (`AdapterNotFound`) from a provider that streams nothing.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn ChatAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any adapter already under `provider_id`.
    pub fn register(&self, provider_id: impl Into<String>, adapter: Arc<dyn ChatAdapter>) {
        let provider_id = provider_id.into();
        if self.adapters.insert(provider_id.clone(), adapter).is_some() {
            warn!("Replaced adapter for provider '{}'", provider_id);
        } else {
            debug!("Registered adapter for provider '{}'", provider_id);
        }
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn ChatAdapter>, RegistryError> {
        self.adapters
            .get(provider_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::AdapterNotFound {
                provider_id: provider_id.to_string(),
            })
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.adapters.contains_key(provider_id)
    }

    /// Registered provider ids, sorted
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
