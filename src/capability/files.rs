//! File access capability: read files, list directories, fetch media.
//!
//! Paths can be absolute (e.g., `/etc/hosts`) or relative to the provider's
//! root directory. Everything here is read-only.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{required_str, CapabilityError, CapabilityProvider, ToolDefinition, ToolOutput};

/// Largest file `read_media` will return inline.
const MAX_MEDIA_BYTES: u64 = 10 * 1024 * 1024;

/// Resolve a path - if absolute, use as-is; if relative, join with root.
fn resolve_path(path_str: &str, root: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn media_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        _ => return None,
    };
    Some(mime)
}

pub struct FilesProvider {
    root: PathBuf,
}

impl FilesProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_file(&self, args: &Value) -> anyhow::Result<ToolOutput> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;
        let full_path = resolve_path(path, &self.root);

        if !full_path.exists() {
            return Err(anyhow::anyhow!("File not found: {}", path));
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let start = args["start_line"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(1)
            .saturating_sub(1)
            .min(total_lines);
        let end = args["end_line"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(total_lines)
            .min(total_lines);
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        if start >= total_lines && total_lines > 0 {
            return Ok(ToolOutput::text(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total_lines,
                start + 1
            )));
        }

        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
            .collect();

        Ok(ToolOutput::text(numbered.join("\n")))
    }

    async fn list_directory(&self, args: &Value) -> anyhow::Result<ToolOutput> {
        let path = args["path"].as_str().unwrap_or(".");
        let full_path = resolve_path(path, &self.root);

        let mut entries = tokio::fs::read_dir(&full_path)
            .await
            .map_err(|e| anyhow::anyhow!("Cannot list {}: {}", path, e))?;

        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            listing.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "type": if metadata.is_dir() { "directory" } else { "file" },
                "size": metadata.len(),
            }));
        }
        listing.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(ToolOutput::Structured(json!({
            "path": full_path.to_string_lossy(),
            "entries": listing,
        })))
    }

    async fn read_media(&self, args: &Value) -> Result<ToolOutput, CapabilityError> {
        let path = required_str(args, "path")?;
        let full_path = resolve_path(path, &self.root);

        let mime_type = media_mime_type(&full_path).ok_or_else(|| {
            CapabilityError::InvalidArguments(format!("Unsupported media type: {}", path))
        })?;

        let metadata = tokio::fs::metadata(&full_path)
            .await
            .map_err(|_| anyhow::anyhow!("File not found: {}", path))?;
        if metadata.len() > MAX_MEDIA_BYTES {
            return Err(anyhow::anyhow!(
                "{} is {} bytes, larger than the {} byte limit",
                path,
                metadata.len(),
                MAX_MEDIA_BYTES
            )
            .into());
        }

        let data = tokio::fs::read(&full_path).await.map_err(anyhow::Error::from)?;
        Ok(ToolOutput::Binary {
            mime_type: mime_type.to_string(),
            data,
        })
    }
}

#[async_trait]
impl CapabilityProvider for FilesProvider {
    fn id(&self) -> &str {
        "files"
    }

    fn name(&self) -> &str {
        "Files"
    }

    async fn activated(&self) -> bool {
        tokio::fs::metadata(&self.root).await.is_ok()
    }

    async fn activate(&self) -> Result<(), CapabilityError> {
        if self.activated().await {
            Ok(())
        } else {
            Err(CapabilityError::NotActivated(format!(
                "root directory {} is not accessible",
                self.root.display()
            )))
        }
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "read_file",
                "Read the contents of a text file. Returns the content with line numbers.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path to the file. Absolute, or relative to the shared root."
                        },
                        "start_line": {
                            "type": "integer",
                            "description": "Optional: start reading from this line number (1-indexed)"
                        },
                        "end_line": {
                            "type": "integer",
                            "description": "Optional: stop reading at this line number (inclusive)"
                        }
                    },
                    "required": ["path"]
                }),
            )
            .titled("Read File")
            .read_only(true)
            .open_world(false),
            ToolDefinition::new(
                "list_directory",
                "List the entries of a directory with their type and size.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Directory to list (default: the shared root)"
                        }
                    }
                }),
            )
            .titled("List Directory")
            .read_only(true)
            .open_world(false),
            ToolDefinition::new(
                "read_media",
                "Return an image or audio file so it can be viewed or played.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path to a png, jpeg, gif, webp, mp3, wav, m4a, ogg or flac file"
                        }
                    },
                    "required": ["path"]
                }),
            )
            .titled("Read Media")
            .read_only(true)
            .open_world(false),
        ]
    }

    async fn call(
        &self,
        name: &str,
        arguments: Value,
    ) -> Option<Result<ToolOutput, CapabilityError>> {
        let result = match name {
            "read_file" => self.read_file(&arguments).await.map_err(CapabilityError::from),
            "list_directory" => self.list_directory(&arguments).await.map_err(CapabilityError::from),
            "read_media" => self.read_media(&arguments).await,
            _ => return None,
        };
        Some(result)
    }
}
