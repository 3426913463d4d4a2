//! Edit tool — exact string replacement inside one file.

use std::sync::Arc;

use async_trait::async_trait;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};

use crate::context::{ToolContext, required_str};

pub struct EditFileTool {
    ctx: Arc<ToolContext>,
}

impl EditFileTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. old_string must match exactly once unless replace_all is true."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The file to edit" },
                "old_string": { "type": "string", "description": "Exact text to replace" },
                "new_string": { "type": "string", "description": "Replacement text" },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of exactly one"
                }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::RequiresApproval
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let raw = required_str(&arguments, "path")?;
        let old = required_str(&arguments, "old_string")?;
        let new = required_str(&arguments, "new_string")?;
        let replace_all = arguments["replace_all"].as_bool().unwrap_or(false);

        if old.is_empty() {
            return Err(ToolError::InvalidArguments("old_string must not be empty".into()));
        }

        let path = self.ctx.resolve(self.name(), raw)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return Ok(ToolOutput::failed(format!("Failed to read {raw}: {e}"))),
        };

        let count = content.matches(old).count();
        let updated = match (count, replace_all) {
            (0, _) => {
                return Ok(ToolOutput::failed(format!("old_string not found in {raw}")));
            }
            (1, _) | (_, true) => content.replace(old, new),
            (n, false) => {
                return Ok(ToolOutput::failed(format!(
                    "old_string matches {n} times in {raw}; add context or set replace_all"
                )));
            }
        };

        match tokio::fs::write(&path, updated).await {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "Replaced {count} occurrence{} in {raw}",
                if count == 1 { "" } else { "s" }
            ))),
            Err(e) => Ok(ToolOutput::failed(format!("Failed to write {raw}: {e}"))),
        }
    }
}
