//! Message domain types.
//!
//! Messages are the unit of conversation history. Once appended to a
//! session they are never edited; the order of the sequence is the only
//! sequencing authority.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ToolError;
use crate::tool::{ToolResult, ToolStatus};

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// An image attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub path: PathBuf,
    pub mime_type: String,
}

impl ImageRef {
    /// Reference an image file, deriving the MIME type from its extension.
    ///
    /// Unknown extensions fall back to `image/jpeg`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mime_type = mime_for(&path).to_string();
        Self { path, mime_type }
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// A tool invocation requested by the model.
///
/// Arguments stay in their raw JSON text form until dispatch so that a
/// malformed payload can be reported back to the model verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON string
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the argument payload. An empty payload is treated as `{}`.
    pub fn parse_arguments(&self) -> Result<serde_json::Value, ToolError> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments).map_err(|e| {
            ToolError::InvalidArguments(format!("arguments for '{}' are not valid JSON: {e}", self.name))
        })
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Attached image (user messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,

    /// Tool calls requested by the assistant, in emission order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Outcome of the tool call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<ToolStatus>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (provider info, truncation markers, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            image: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_status: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a user message carrying an image.
    pub fn user_with_image(content: impl Into<String>, image: ImageRef) -> Self {
        let mut msg = Self::user(content);
        msg.image = Some(image);
        msg
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        let mut msg = Self::assistant(content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Create the tool message that records a [`ToolResult`].
    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::with_role(Role::Tool, result.transcript_text());
        msg.tool_call_id = Some(result.call_id.clone());
        msg.tool_status = Some(result.status);
        if let Some(data) = &result.data {
            msg.metadata.insert("data".into(), data.clone());
        }
        msg
    }

    /// Whether this is an assistant message requesting tools.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
        assert!(msg.image.is_none());
    }

    #[test]
    fn image_mime_from_extension() {
        assert_eq!(ImageRef::from_path("shot.PNG").mime_type, "image/png");
        assert_eq!(ImageRef::from_path("a/b.webp").mime_type, "image/webp");
        assert_eq!(ImageRef::from_path("photo.jpeg").mime_type, "image/jpeg");
        assert_eq!(ImageRef::from_path("noext").mime_type, "image/jpeg");
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        let call = ToolCallRequest::new("c1", "list_dir", "  ");
        assert_eq!(call.parse_arguments().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn malformed_arguments_are_invalid() {
        let call = ToolCallRequest::new("c1", "read_file", "{\"path\": ");
        let err = call.parse_arguments().unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert!(err.to_string().contains("read_file"));
    }

    #[test]
    fn tool_result_message_links_call() {
        let result = ToolResult::denied("call_9", "policy is never");
        let msg = Message::tool_result(&result);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(msg.tool_status, Some(ToolStatus::Denied));
        assert!(msg.content.contains("policy is never"));
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("c1", "shell", r#"{"command":"ls"}"#)],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert!(back.has_tool_calls());
    }
}
