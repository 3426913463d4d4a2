//! File read tool — read file contents with path validation.

use std::sync::Arc;

use async_trait::async_trait;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};

use crate::context::{ToolContext, required_str, truncate_output};

/// Files larger than this are cut off in the transcript.
const MAX_READ_BYTES: usize = 256 * 1024;

pub struct ReadFileTool {
    ctx: Arc<ToolContext>,
}

impl ReadFileTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file. Optionally pass a 1-based start line and a line count."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read, relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based line to start from"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::Safe
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let raw = required_str(&arguments, "path")?;
        let path = self.ctx.resolve(self.name(), raw)?;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return Ok(ToolOutput::failed(format!("Failed to read {raw}: {e}"))),
        };

        let offset = arguments["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = arguments["limit"].as_u64().map(|l| l as usize);
        let total_lines = content.lines().count();

        let output = if offset == 1 && limit.is_none() {
            content
        } else {
            let lines = content.lines().skip(offset - 1);
            let selected: Vec<&str> = match limit {
                Some(limit) => lines.take(limit).collect(),
                None => lines.collect(),
            };
            selected.join("\n")
        };

        Ok(ToolOutput::ok(truncate_output(output, MAX_READ_BYTES)).with_data(serde_json::json!({
            "path": path.display().to_string(),
            "total_lines": total_lines,
        })))
    }
}
