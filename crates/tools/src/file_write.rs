//! File write tool — write or create files with path validation.

use std::sync::Arc;

use async_trait::async_trait;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};

use crate::context::{ToolContext, required_str};

pub struct WriteFileTool {
    ctx: Arc<ToolContext>,
}

impl WriteFileTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file and missing parent directories if needed, overwrites if it exists."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to"
                },
                "content": {
                    "type": "string",
                    "description": "The full new content of the file"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::RequiresApproval
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let raw = required_str(&arguments, "path")?;
        let content = required_str(&arguments, "content")?;
        let path = self.ctx.resolve(self.name(), raw)?;

        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(ToolOutput::failed(format!("Failed to create directory: {e}")));
        }

        let existed = path.exists();
        match tokio::fs::write(&path, content).await {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "{} {raw} ({} bytes)",
                if existed { "Overwrote" } else { "Created" },
                content.len()
            ))),
            Err(e) => Ok(ToolOutput::failed(format!("Failed to write {raw}: {e}"))),
        }
    }
}
