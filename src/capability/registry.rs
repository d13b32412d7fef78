//! Ordered provider registry with enablement-filtered aggregation and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{
    CapabilityError, CapabilityProvider, ResourceContent, ResourceTemplate, ToolDefinition,
    ToolOutput,
};

/// Reads the current enabled flag of one capability.
pub type EnabledAccessor = Arc<dyn Fn() -> bool + Send + Sync>;

/// Capability id to enabled accessor. Replaced wholesale, never edited in place.
pub type CapabilityBindings = HashMap<String, EnabledAccessor>;

/// Fixed, ordered list of providers. Registration order is dispatch priority.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    providers: Vec<Arc<dyn CapabilityProvider>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn CapabilityProvider>) {
        if self.providers.iter().any(|p| p.id() == provider.id()) {
            tracing::warn!("Capability '{}' registered twice, ignoring duplicate", provider.id());
            return;
        }
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn CapabilityProvider>] {
        &self.providers
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn CapabilityProvider>> {
        self.providers.iter().find(|p| p.id() == id)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Providers whose accessor currently reports enabled, in registry order.
    /// A provider without a binding counts as disabled.
    fn enabled<'a>(
        &'a self,
        bindings: &'a CapabilityBindings,
    ) -> impl Iterator<Item = &'a Arc<dyn CapabilityProvider>> + 'a {
        self.providers.iter().filter(move |provider| {
            bindings
                .get(provider.id())
                .map(|is_enabled| is_enabled())
                .unwrap_or(false)
        })
    }

    pub fn list_tools(&self, bindings: &CapabilityBindings) -> Vec<ToolDefinition> {
        self.enabled(bindings)
            .flat_map(|provider| provider.tools())
            .collect()
    }

    /// First enabled provider that recognizes `name` handles the call.
    pub async fn call_tool(
        &self,
        bindings: &CapabilityBindings,
        name: &str,
        arguments: Value,
    ) -> Result<ToolOutput, CapabilityError> {
        for provider in self.enabled(bindings) {
            if let Some(result) = provider.call(name, arguments.clone()).await {
                if let Err(e) = &result {
                    tracing::debug!("Tool '{}' from '{}' failed: {}", name, provider.id(), e);
                }
                return result;
            }
        }
        Err(CapabilityError::ToolNotFound(name.to_string()))
    }

    pub fn resource_templates(&self, bindings: &CapabilityBindings) -> Vec<ResourceTemplate> {
        self.enabled(bindings)
            .flat_map(|provider| provider.resource_templates())
            .collect()
    }

    pub async fn read_resource(
        &self,
        bindings: &CapabilityBindings,
        uri: &str,
    ) -> Result<ResourceContent, CapabilityError> {
        for provider in self.enabled(bindings) {
            if let Some(result) = provider.read(uri).await {
                return result;
            }
        }
        Err(CapabilityError::ResourceNotFound(uri.to_string()))
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}
