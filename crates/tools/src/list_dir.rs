//! Directory listing tool.

use std::sync::Arc;

use async_trait::async_trait;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};

use crate::context::ToolContext;

const MAX_ENTRIES: usize = 1_000;

pub struct ListDirTool {
    ctx: Arc<ToolContext>,
}

impl ListDirTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are shown with a trailing '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: working directory)"
                }
            },
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::Safe
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let raw = arguments["path"].as_str().unwrap_or(".");
        let path = self.ctx.resolve(self.name(), raw)?;

        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(r) => r,
            Err(e) => return Ok(ToolOutput::failed(format!("Failed to list {raw}: {e}"))),
        };

        let mut entries = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                        name.push('/');
                    }
                    entries.push(name);
                }
                Ok(None) => break,
                Err(e) => return Ok(ToolOutput::failed(format!("Failed to list {raw}: {e}"))),
            }
        }
        entries.sort();

        let total = entries.len();
        if total == 0 {
            return Ok(ToolOutput::ok("(empty directory)"));
        }
        let mut output = entries
            .iter()
            .take(MAX_ENTRIES)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_ENTRIES {
            output.push_str(&format!("\n[{} more entries]", total - MAX_ENTRIES));
        }
        Ok(ToolOutput::ok(output).with_data(serde_json::json!({ "count": total })))
    }
}
