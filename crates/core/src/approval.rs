//! Approval policy types and the human-decision seam.
//!
//! The gate logic itself lives in `termagent-security`; this module holds
//! the vocabulary shared by the gate, the session log and the UI.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::DangerClass;

/// Session-scoped policy controlling when the user is asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Never ask; only always-confirm tools still prompt.
    Auto,
    /// Ask for requires-approval and always-confirm tools.
    #[default]
    OnRequest,
    /// Deny anything that is not safe, without asking.
    Never,
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::OnRequest => "on-request",
            Self::Never => "never",
        })
    }
}

impl FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "on-request" | "on_request" | "onrequest" => Ok(Self::OnRequest),
            "never" => Ok(Self::Never),
            other => Err(format!(
                "unknown approval policy '{other}' (expected auto, on-request or never)"
            )),
        }
    }
}

/// What the gate decided for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    Allow,
    Deny,
    AskUser,
}

/// A human answer to an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalResponse {
    Approve,
    ApproveAlwaysThisSession,
    Deny,
}

/// Everything the UI needs to ask the user about one call.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub call_id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub danger_class: DangerClass,
}

/// Injected decision function that resolves an `AskUser` decision.
///
/// Implementations may take arbitrarily long; the orchestrator races the
/// call against cancellation.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalResponse;
}

/// A change recorded in a session's policy log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyChange {
    /// The session's approval policy was switched.
    PolicySet {
        from: ApprovalPolicy,
        to: ApprovalPolicy,
    },
    /// The user answered approve-always-this-session for a tool.
    ToolAllowedForSession { tool: String },
    /// All per-session tool overrides were dropped.
    OverridesRevoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLogEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub change: PolicyChange,
}
