//! The `parse_file` tool: read documents from a fixed corpus directory.

use crate::extract::{bytes_look_like_html, bytes_look_like_pdf, html_to_text, pdf_to_text, truncate_chars};
use crate::search::{string_or_list, BLOCK_SEPARATOR};
use crate::{Capability, Error, Result};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};

const MAX_FILE_BYTES: u64 = 50_000_000;
const MAX_TEXT_CHARS: usize = 100_000;

pub struct FileParser {
    root: PathBuf,
}

impl FileParser {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `name` under the root, refusing anything that escapes it.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Tool(format!("path escapes the file root: {name}")));
        }
        let root = std::fs::canonicalize(&self.root)
            .map_err(|e| Error::NotConfigured(format!("file root {}: {e}", self.root.display())))?;
        let full = std::fs::canonicalize(root.join(rel))
            .map_err(|e| Error::Tool(format!("{name}: {e}")))?;
        // Symlinks can still point outside.
        if !full.starts_with(&root) {
            return Err(Error::Tool(format!("path escapes the file root: {name}")));
        }
        Ok(full)
    }

    async fn parse_one(&self, name: &str) -> Result<String> {
        let path = self.resolve(name)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::Tool(format!("{name}: {e}")))?;
        if !meta.is_file() {
            return Err(Error::Tool(format!("{name}: not a regular file")));
        }
        if meta.len() > MAX_FILE_BYTES {
            return Err(Error::Tool(format!("{name}: file too large ({} bytes)", meta.len())));
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Tool(format!("{name}: {e}")))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let text = if ext == "pdf" || bytes_look_like_pdf(&bytes) {
            pdf_to_text(&bytes).map_err(|e| Error::Tool(format!("{name}: pdf extraction failed: {e}")))?
        } else if matches!(ext.as_str(), "html" | "htm") || bytes_look_like_html(&bytes) {
            html_to_text(&String::from_utf8_lossy(&bytes), 100)
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };

        let (mut text, truncated) = truncate_chars(text.trim(), MAX_TEXT_CHARS);
        if truncated {
            text.push_str("\n[content truncated]");
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl Capability for FileParser {
    fn name(&self) -> &'static str {
        "parse_file"
    }

    fn description(&self) -> &'static str {
        "Parse user-provided files (PDF, HTML, plain text) and return their textual content."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "File names relative to the provided file corpus."
                }
            },
            "required": ["files"]
        })
    }

    async fn call(&self, arguments: &Value) -> Result<String> {
        let files = string_or_list(arguments.get("files"));
        if files.is_empty() {
            return Err(Error::Tool(
                "[parse_file] Invalid request format: 'files' must list at least one file name"
                    .to_string(),
            ));
        }
        let mut blocks = Vec::with_capacity(files.len());
        for name in &files {
            let block = match self.parse_one(name).await {
                Ok(text) => format!("# File: {name}\n{text}"),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "parse_file failed");
                    format!("# File: {name}\n[parse_file] {e}")
                }
            };
            blocks.push(block);
        }
        Ok(blocks.join(BLOCK_SEPARATOR))
    }
}
