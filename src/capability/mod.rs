//! Capability providers.
//!
//! A capability provider is a system integration (files, host information,
//! calendars, ...) that contributes an ordered list of tools and optionally
//! some readable resources. Providers are chained: [`CapabilityProvider::call`]
//! returns `None` when the tool name is not one of its own, so the registry can
//! move on to the next provider in priority order.

mod files;
mod registry;
mod system;

pub use files::FilesProvider;
pub use registry::{CapabilityBindings, CapabilityRegistry, EnabledAccessor};
pub use system::SystemProvider;

#[cfg(test)]
pub(crate) use registry::tests::{flag, EchoProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by capability providers and the registry.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Covers both unknown tools and tools of a disabled provider.
    #[error("Tool not found or service not enabled: {0}")]
    ToolNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Capability not activated: {0}")]
    NotActivated(String),

    #[error("{0}")]
    Failed(#[from] anyhow::Error),
}

/// Hints attached to a tool definition, passed through to peers verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

/// A tool as advertised in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: ToolAnnotations,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            annotations: ToolAnnotations::default(),
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.annotations.title = Some(title.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.annotations.read_only_hint = Some(read_only);
        self
    }

    pub fn open_world(mut self, open_world: bool) -> Self {
        self.annotations.open_world_hint = Some(open_world);
        self
    }
}

/// The value a tool produced.
///
/// Binary payloads carry a declared mime type; the wire encoding (image,
/// audio or embedded blob) is picked from it.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Structured(Value),
    Binary { mime_type: String, data: Vec<u8> },
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Structured(Value::String(text.into()))
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Self::Structured(_) => "application/json",
            Self::Binary { mime_type, .. } => mime_type,
        }
    }
}

/// A parameterised resource a provider can serve through `resources/read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub uri_template: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Text contents of a resource read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: String,
    pub text: String,
}

/// Contract implemented by every capability provider.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Stable identifier used for enablement lookups and persisted flags.
    fn id(&self) -> &str;

    /// Human readable name.
    fn name(&self) -> &str;

    /// Whether the provider has the OS-level access it needs.
    async fn activated(&self) -> bool;

    /// Request access. Idempotent; may prompt the user out of band.
    async fn activate(&self) -> Result<(), CapabilityError>;

    /// Ordered tool catalog.
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Run `name` if it belongs to this provider, `None` otherwise.
    async fn call(
        &self,
        name: &str,
        arguments: Value,
    ) -> Option<Result<ToolOutput, CapabilityError>>;

    fn resource_templates(&self) -> Vec<ResourceTemplate> {
        Vec::new()
    }

    /// Read `uri` if this provider serves it, `None` otherwise.
    async fn read(&self, _uri: &str) -> Option<Result<ResourceContent, CapabilityError>> {
        None
    }
}

/// Pull a required string argument out of a tool call's arguments.
pub(crate) fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, CapabilityError> {
    arguments[key]
        .as_str()
        .ok_or_else(|| CapabilityError::InvalidArguments(format!("Missing '{}' argument", key)))
}
