//! Tool dispatcher — runs one approved call and normalizes the outcome.
//!
//! Every path out of the dispatcher is a [`ToolResult`]: unknown tools,
//! bad arguments, tool errors, panics, timeouts and cancellation all
//! become results instead of propagating.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use termagent_core::message::ToolCallRequest;
use termagent_core::tool::{DangerClass, Tool, ToolRegistry, ToolResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A call that passed lookup and schema validation, ready for the gate.
pub struct PreparedCall {
    pub call: ToolCallRequest,
    pub tool: Arc<dyn Tool>,
    pub arguments: serde_json::Value,
    /// Class declared at registration
    pub declared: DangerClass,
    /// Class of this concrete invocation
    pub invocation: DangerClass,
    pub timeout: Duration,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Look up and validate a call. Failures are returned as the `error`
    /// result to record for it.
    pub fn prepare(&self, call: &ToolCallRequest) -> Result<PreparedCall, ToolResult> {
        match self.registry.validate(call) {
            Ok(validated) => {
                let invocation = escalate(
                    validated.descriptor.danger_class,
                    validated.tool.classify(&validated.arguments),
                );
                Ok(PreparedCall {
                    call: call.clone(),
                    declared: validated.descriptor.danger_class,
                    invocation,
                    timeout: validated.descriptor.timeout,
                    tool: validated.tool,
                    arguments: validated.arguments,
                })
            }
            Err(e) => {
                debug!(tool = %call.name, call_id = %call.id, error = %e, "Rejected tool call");
                Err(ToolResult::error(&call.id, e.to_string()))
            }
        }
    }

    /// Run a prepared call to completion, timeout or cancellation.
    ///
    /// The tool runs on its own task so a panic is contained. On timeout
    /// or cancellation the task is aborted, which drops the tool's future
    /// (and kills any child it spawned with kill-on-drop).
    pub async fn dispatch(&self, prepared: PreparedCall, cancel: &CancellationToken) -> ToolResult {
        let PreparedCall {
            call,
            tool,
            arguments,
            timeout,
            ..
        } = prepared;
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { tool.execute(arguments).await });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                ToolResult::cancelled(&call.id)
            }
            _ = tokio::time::sleep(timeout) => {
                handle.abort();
                warn!(tool = %call.name, call_id = %call.id, timeout_secs = timeout.as_secs(), "Tool timed out");
                ToolResult::timeout(&call.id, timeout)
            }
            joined = &mut handle => match joined {
                Ok(Ok(output)) => ToolResult::from_output(&call.id, output),
                Ok(Err(e)) => ToolResult::error(&call.id, e.to_string()),
                Err(e) if e.is_panic() => {
                    let detail = panic_message(e.into_panic());
                    warn!(tool = %call.name, call_id = %call.id, panic = %detail, "Tool panicked");
                    ToolResult::error(&call.id, format!("tool '{}' panicked: {detail}", call.name))
                }
                Err(e) => ToolResult::error(&call.id, format!("tool task failed: {e}")),
            },
        };

        debug!(
            tool = %call.name,
            call_id = %call.id,
            status = %result.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        result
    }

    /// Validate and run a call without consulting any approval gate.
    pub async fn execute(&self, call: &ToolCallRequest, cancel: &CancellationToken) -> ToolResult {
        match self.prepare(call) {
            Ok(prepared) => self.dispatch(prepared, cancel).await,
            Err(result) => result,
        }
    }
}

/// An invocation class may only raise the declared class.
fn escalate(declared: DangerClass, invocation: DangerClass) -> DangerClass {
    fn rank(class: DangerClass) -> u8 {
        match class {
            DangerClass::Safe => 0,
            DangerClass::RequiresApproval => 1,
            DangerClass::AlwaysConfirm => 2,
        }
    }
    if rank(invocation) > rank(declared) {
        invocation
    } else {
        declared
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
