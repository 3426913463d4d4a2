//! # termagent core
//!
//! Domain types, traits, and error definitions for the termagent coding agent.
//! Every other crate in the workspace depends inward on this one.
//!
//! Each subsystem the orchestrator talks to is a trait here:
//! - [`Provider`] for LLM backends
//! - [`Tool`] for model-invokable actions, collected in a [`ToolRegistry`]
//! - [`SessionStore`] for conversation persistence
//! - [`Approver`] for the human side of the approval gate

pub mod approval;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod schema;
pub mod session;
pub mod tool;

pub use approval::{
    ApprovalDecision, ApprovalPolicy, ApprovalRequest, ApprovalResponse, Approver, PolicyChange,
    PolicyLogEntry,
};
pub use error::{Error, ProviderError, Result, SessionError, ToolError};
pub use event::{AgentEvent, EventBus};
pub use message::{ImageRef, Message, Role, ToolCallRequest};
pub use provider::{
    Capabilities, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage,
};
pub use session::{
    Checkpoint, Session, SessionId, SessionSettings, SessionStats, SessionStore, SessionSummary,
    SessionUpdate,
};
pub use tool::{DangerClass, Tool, ToolDescriptor, ToolOutput, ToolRegistry, ToolResult, ToolStatus};
