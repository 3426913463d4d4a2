//! The termagent turn loop.
//!
//! An [`Orchestrator`] drives one session through a turn:
//!
//! 1. **Append** the user's message
//! 2. **Request** a reply from the configured provider, streaming text
//! 3. **If tool calls**: gate each call, dispatch the approved ones in
//!    order, append one result per call, loop back to step 2
//! 4. **If text only**: append the reply and return to idle
//!
//! The loop stops early on cancellation, on a transport failure after
//! retries, or when the batch limit is reached.

pub mod dispatcher;
pub mod error;
pub mod orchestrator;

pub use dispatcher::{PreparedCall, ToolDispatcher};
pub use error::AgentError;
pub use orchestrator::{Orchestrator, TurnOutcome};
