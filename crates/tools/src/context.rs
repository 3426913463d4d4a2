//! State shared by the built-in file tools.

use std::path::{Path, PathBuf};

use termagent_core::error::ToolError;
use termagent_security::PathPolicy;

/// Working directory plus the path policy every file tool enforces.
#[derive(Debug, Clone)]
pub struct ToolContext {
    cwd: PathBuf,
    paths: PathPolicy,
}

impl ToolContext {
    pub fn new(cwd: impl Into<PathBuf>, paths: PathPolicy) -> Self {
        Self {
            cwd: cwd.into(),
            paths,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Resolve a model-supplied path for `tool`, rejecting forbidden ones.
    pub fn resolve(&self, tool: &str, raw: &str) -> Result<PathBuf, ToolError> {
        self.paths
            .resolve(&self.cwd, raw)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: tool.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Read a required string argument.
pub(crate) fn required_str<'a>(
    arguments: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    arguments[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

/// Cut `text` to at most `max` bytes on a char boundary, noting the cut.
pub(crate) fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let total = text.len();
    text.truncate(cut);
    text.push_str(&format!("\n[output truncated: {total} bytes total]"));
    text
}
