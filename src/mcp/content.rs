//! Conversion of tool outcomes into `tools/call` result payloads.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{CapabilityError, ToolOutput};

/// URI given to binary results that are neither image nor audio.
const BLOB_URI: &str = "toolbridge://result";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: EmbeddedBlob,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedBlob {
    pub uri: String,
    pub mime_type: String,
    pub blob: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    pub is_error: bool,
}

impl CallToolResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            structured_content: None,
            is_error: true,
        }
    }
}

impl From<ToolOutput> for CallToolResult {
    fn from(output: ToolOutput) -> Self {
        match output {
            ToolOutput::Structured(Value::String(text)) => Self {
                content: vec![ToolContent::Text { text }],
                structured_content: None,
                is_error: false,
            },
            ToolOutput::Structured(value) => {
                let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                Self {
                    content: vec![ToolContent::Text { text }],
                    structured_content: value.is_object().then_some(value),
                    is_error: false,
                }
            }
            ToolOutput::Binary { mime_type, data } => {
                let data = STANDARD.encode(data);
                let content = if mime_type.starts_with("image/") {
                    ToolContent::Image { data, mime_type }
                } else if mime_type.starts_with("audio/") {
                    ToolContent::Audio { data, mime_type }
                } else {
                    ToolContent::Resource {
                        resource: EmbeddedBlob {
                            uri: BLOB_URI.to_string(),
                            mime_type,
                            blob: data,
                        },
                    }
                };
                Self {
                    content: vec![content],
                    structured_content: None,
                    is_error: false,
                }
            }
        }
    }
}

/// Failures become a result with `isError: true`, never a protocol fault.
pub fn tool_result(outcome: Result<ToolOutput, CapabilityError>) -> CallToolResult {
    match outcome {
        Ok(output) => output.into(),
        Err(e) => CallToolResult::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_image_mime_becomes_image_content() {
        let result = tool_result(Ok(ToolOutput::Binary {
            mime_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        }));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["content"][0]["type"], "image");
        assert_eq!(value["content"][0]["mimeType"], "image/png");
        assert_eq!(value["content"][0]["data"], "AQID");
        assert_eq!(value["isError"], false);
    }

    #[test]
    fn test_audio_mime_becomes_audio_content() {
        let result = tool_result(Ok(ToolOutput::Binary {
            mime_type: "audio/mpeg".to_string(),
            data: vec![0xff],
        }));
        assert!(matches!(result.content[0], ToolContent::Audio { .. }));
    }

    #[test]
    fn test_structured_object_keeps_structured_content() {
        let result = tool_result(Ok(ToolOutput::Structured(json!({"events": []}))));
        assert_eq!(result.structured_content, Some(json!({"events": []})));
        assert!(!result.is_error);
    }

    #[test]
    fn test_error_is_flagged_result() {
        let result = tool_result(Err(CapabilityError::ToolNotFound("calendar_events".into())));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["isError"], true);
        assert_eq!(
            value["content"][0]["text"],
            "Tool not found or service not enabled: calendar_events"
        );
    }
}
