//! Safety layer for termagent: the approval gate, audit logging and
//! filesystem path validation.
//!
//! Provides:
//! - **Approval gate**: decides allow / deny / ask-user for each tool call
//! - **Audit logging**: structured record of decisions and policy changes
//! - **Path validation**: keeps file tools away from forbidden locations

pub mod audit;
pub mod gate;
pub mod path;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use gate::{ApprovalGate, Verdict, decide};
pub use path::{PathPolicy, PathValidationError, expand_tilde};
