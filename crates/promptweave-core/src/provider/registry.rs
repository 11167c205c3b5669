//! Provider registry for runtime provider lookup.
//!
//! A simple name-indexed registry of boxed model providers.

use std::collections::HashMap;

use super::box_provider::BoxModelProvider;

/// Registry of available model providers, indexed by label.
///
/// Steps select a provider by `provider_label`; the runner falls back to
/// its configured default when a step names none.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, BoxModelProvider>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider under the given label.
    ///
    /// If a provider with this label already exists, it is replaced.
    pub fn register(&mut self, label: impl Into<String>, provider: BoxModelProvider) {
        self.providers.insert(label.into(), provider);
    }

    /// Look up a provider by label.
    pub fn get(&self, label: &str) -> Option<&BoxModelProvider> {
        self.providers.get(label)
    }

    /// List all registered provider labels.
    pub fn list_labels(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}
