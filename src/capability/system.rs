//! Host information capability.

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::{json, Value};
use sysinfo::System;

use super::{
    CapabilityError, CapabilityProvider, ResourceContent, ResourceTemplate, ToolDefinition,
    ToolOutput,
};

const INFO_URI: &str = "system://info";

#[derive(Debug, Default)]
pub struct SystemProvider;

impl SystemProvider {
    pub fn new() -> Self {
        Self
    }

    fn snapshot() -> Value {
        let sys = System::new_all();

        json!({
            "os": System::name(),
            "os_version": System::os_version(),
            "kernel_version": System::kernel_version(),
            "host_name": System::host_name(),
            "cpu_count": sys.cpus().len(),
            "total_memory_bytes": sys.total_memory(),
            "used_memory_bytes": sys.used_memory(),
            "uptime_secs": System::uptime(),
        })
    }

    fn current_time() -> Value {
        let local = Local::now();
        json!({
            "utc": Utc::now().to_rfc3339(),
            "local": local.to_rfc3339(),
            "timezone_offset": local.offset().to_string(),
        })
    }
}

#[async_trait]
impl CapabilityProvider for SystemProvider {
    fn id(&self) -> &str {
        "system"
    }

    fn name(&self) -> &str {
        "System"
    }

    async fn activated(&self) -> bool {
        true
    }

    async fn activate(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "system_info",
                "Describe the host: operating system, host name, CPU count, memory and uptime.",
                json!({"type": "object", "properties": {}}),
            )
            .titled("System Information")
            .read_only(true)
            .open_world(false),
            ToolDefinition::new(
                "current_time",
                "Get the current date and time in UTC and in the host's local timezone.",
                json!({"type": "object", "properties": {}}),
            )
            .titled("Current Time")
            .read_only(true)
            .open_world(false),
        ]
    }

    async fn call(
        &self,
        name: &str,
        _arguments: Value,
    ) -> Option<Result<ToolOutput, CapabilityError>> {
        match name {
            "system_info" => {
                let snapshot = tokio::task::spawn_blocking(Self::snapshot)
                    .await
                    .map_err(|e| CapabilityError::Failed(e.into()));
                Some(snapshot.map(ToolOutput::Structured))
            }
            "current_time" => Some(Ok(ToolOutput::Structured(Self::current_time()))),
            _ => None,
        }
    }

    fn resource_templates(&self) -> Vec<ResourceTemplate> {
        vec![ResourceTemplate {
            uri_template: INFO_URI.to_string(),
            name: "System information".to_string(),
            description: Some("Snapshot of the host's OS, CPU and memory".to_string()),
            mime_type: Some("application/json".to_string()),
        }]
    }

    async fn read(&self, uri: &str) -> Option<Result<ResourceContent, CapabilityError>> {
        if uri != INFO_URI {
            return None;
        }
        let snapshot = match tokio::task::spawn_blocking(Self::snapshot).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Some(Err(CapabilityError::Failed(e.into()))),
        };
        Some(
            serde_json::to_string_pretty(&snapshot)
                .map(|text| ResourceContent {
                    uri: uri.to_string(),
                    mime_type: "application/json".to_string(),
                    text,
                })
                .map_err(|e| CapabilityError::Failed(e.into())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_time_has_utc() {
        let output = SystemProvider::new()
            .call("current_time", json!({}))
            .await
            .unwrap()
            .unwrap();
        let ToolOutput::Structured(value) = output else {
            panic!("expected structured output");
        };
        assert!(value["utc"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_info_resource() {
        let provider = SystemProvider::new();
        assert!(provider.read("system://other").await.is_none());

        let content = provider.read(INFO_URI).await.unwrap().unwrap();
        assert_eq!(content.mime_type, "application/json");
        assert!(content.text.contains("cpu_count"));
    }
}
