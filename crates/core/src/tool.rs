//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world:
//! read and edit files, run shell commands, search code, fetch pages.
//! Each tool declares a parameter schema and a [`DangerClass`]; the
//! [`ToolRegistry`] turns those declarations into immutable
//! [`ToolDescriptor`]s when the tool is registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::message::ToolCallRequest;
use crate::provider::ToolDefinition;
use crate::schema;

/// Default execution timeout for tools that do not declare their own.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Static classification controlling whether an invocation needs approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DangerClass {
    Safe,
    RequiresApproval,
    AlwaysConfirm,
}

impl fmt::Display for DangerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Safe => "safe",
            Self::RequiresApproval => "requires-approval",
            Self::AlwaysConfirm => "always-confirm",
        })
    }
}

/// Outcome of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Denied,
    Timeout,
    Cancelled,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        })
    }
}

/// The normalized result of a tool call, one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    pub status: ToolStatus,

    /// Output text on success, error detail otherwise
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    fn new(call_id: impl Into<String>, status: ToolStatus, output: String) -> Self {
        Self {
            call_id: call_id.into(),
            status,
            output,
            data: None,
        }
    }

    pub fn success(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(call_id, ToolStatus::Success, output.into())
    }

    pub fn error(call_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(call_id, ToolStatus::Error, detail.into())
    }

    pub fn denied(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(call_id, ToolStatus::Denied, reason.into())
    }

    pub fn timeout(call_id: impl Into<String>, after: Duration) -> Self {
        Self::new(
            call_id,
            ToolStatus::Timeout,
            format!("tool timed out after {}s", after.as_secs_f64()),
        )
    }

    pub fn cancelled(call_id: impl Into<String>) -> Self {
        Self::new(call_id, ToolStatus::Cancelled, "cancelled by user".into())
    }

    /// Build the result for a finished [`Tool::execute`] call.
    pub fn from_output(call_id: impl Into<String>, output: ToolOutput) -> Self {
        let status = if output.success {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };
        Self {
            call_id: call_id.into(),
            status,
            output: output.output,
            data: output.data,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// Text recorded in the transcript for this result.
    pub fn transcript_text(&self) -> String {
        match self.status {
            ToolStatus::Success => self.output.clone(),
            status => format!("[{status}] {}", self.output),
        }
    }
}

/// What a tool returns when it ran to completion.
///
/// `success = false` means the action ran but failed (for example a
/// shell command exiting non-zero); its output is still shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The core Tool trait.
///
/// Each tool (read_file, shell, grep, bridged MCP tools, etc.) implements
/// this trait and is registered in the [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Static danger class. Tools that say nothing need approval.
    fn danger_class(&self) -> DangerClass {
        DangerClass::RequiresApproval
    }

    /// Danger class of one concrete invocation.
    ///
    /// May escalate above [`Tool::danger_class`] (a destructive shell
    /// command) but is never consulted to relax it.
    fn classify(&self, _arguments: &serde_json::Value) -> DangerClass {
        self.danger_class()
    }

    /// Tool-specific execution timeout; `None` uses the registry default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute the tool with already-validated arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Immutable declaration of a registered tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub danger_class: DangerClass,
    pub timeout: Duration,
}

impl ToolDescriptor {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

struct Registered {
    descriptor: ToolDescriptor,
    tool: Arc<dyn Tool>,
}

/// A call that passed lookup and schema validation.
pub struct ValidatedCall<'a> {
    pub tool: Arc<dyn Tool>,
    pub descriptor: &'a ToolDescriptor,
    pub arguments: serde_json::Value,
}

/// A registry of available tools.
///
/// Built once at startup, then shared read-only (behind an `Arc`) by every
/// session. The orchestrator uses it to:
/// 1. Get tool definitions to send to the LLM
/// 2. Validate and look up tools when the LLM requests them
pub struct ToolRegistry {
    tools: HashMap<String, Registered>,
    default_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Timeout applied to tools registered afterwards that declare none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.register_shared(Arc::from(tool));
    }

    /// Register an already shared tool.
    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        let descriptor = ToolDescriptor {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
            danger_class: tool.danger_class(),
            timeout: tool.timeout().unwrap_or(self.default_timeout),
        };
        tracing::debug!(tool = %descriptor.name, danger = %descriptor.danger_class, "Registered tool");
        self.tools
            .insert(descriptor.name.clone(), Registered { descriptor, tool });
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|r| &r.descriptor)
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<_> = self.tools.values().map(|r| &r.descriptor).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Get all tool definitions (for sending to the LLM), sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.descriptors()
            .into_iter()
            .map(ToolDescriptor::to_definition)
            .collect()
    }

    /// Resolve a call: the tool must exist and its arguments must satisfy
    /// the declared schema.
    pub fn validate(&self, call: &ToolCallRequest) -> Result<ValidatedCall<'_>, ToolError> {
        let registered = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let arguments = call.parse_arguments()?;
        schema::validate(&registered.descriptor.parameters, &arguments).map_err(|e| {
            ToolError::InvalidArguments(format!("arguments for '{}' rejected: {e}", call.name))
        })?;
        Ok(ValidatedCall {
            tool: Arc::clone(&registered.tool),
            descriptor: &registered.descriptor,
            arguments,
        })
    }

    /// Keep only the named tools. An empty allowlist keeps everything.
    pub fn retain(&mut self, allowed: &[String]) {
        if allowed.is_empty() {
            return;
        }
        self.tools.retain(|name, _| allowed.iter().any(|a| a == name));
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
