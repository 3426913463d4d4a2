//! Delete tool — removes a single file. Always confirmed.

use std::sync::Arc;

use async_trait::async_trait;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};

use crate::context::{ToolContext, required_str};

pub struct DeleteFileTool {
    ctx: Arc<ToolContext>,
}

impl DeleteFileTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file. Directories are not removed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The file to delete" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::AlwaysConfirm
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let raw = required_str(&arguments, "path")?;
        let path = self.ctx.resolve(self.name(), raw)?;

        if path.is_dir() {
            return Ok(ToolOutput::failed(format!("{raw} is a directory")));
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(ToolOutput::ok(format!("Deleted {raw}"))),
            Err(e) => Ok(ToolOutput::failed(format!("Failed to delete {raw}: {e}"))),
        }
    }
}
