//! The agent orchestrator — turns one user input into a finished turn.
//!
//! States: **Idle** → **Requesting** → (**Dispatching** → **Requesting**)*
//! → **Idle**, with **Failed** reachable from Requesting. Each turn reads
//! one configuration snapshot at its start and keeps it to the end, so a
//! `/model` or `/provider` change takes effect on the next turn.
//!
//! History is only ever changed through the [`SessionStore`]:
//! - the user message is appended before the first request and survives
//!   failures;
//! - an assistant message is appended once its exchange completed (or was
//!   cancelled mid-stream, in which case the partial text is kept);
//! - every tool call of a batch gets exactly one result, appended in
//!   request order, before the next request is sent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use termagent_config::{AppConfig, ConfigHandle};
use termagent_core::approval::{
    ApprovalDecision, ApprovalPolicy, ApprovalRequest, ApprovalResponse, Approver,
};
use termagent_core::error::ProviderError;
use termagent_core::event::{AgentEvent, EventBus};
use termagent_core::message::{Message, Role, ToolCallRequest};
use termagent_core::provider::{Capabilities, Provider, ProviderRequest, Usage};
use termagent_core::session::{Session, SessionSettings, SessionStore, SessionUpdate};
use termagent_core::tool::{ToolRegistry, ToolResult, ToolStatus};
use termagent_providers::{ProviderRouter, RetryPolicy};
use termagent_security::{ApprovalGate, AuditEvent, AuditOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{PreparedCall, ToolDispatcher};
use crate::error::AgentError;

/// Summary of a finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Text of the final assistant message (partial if cancelled)
    pub text: String,
    /// Tool-call batches dispatched during the turn
    pub batches: u32,
    pub tool_calls: u32,
    pub usage: Usage,
    pub cancelled: bool,
}

/// What one provider exchange produced.
enum Exchange {
    Reply {
        text: String,
        tool_calls: Vec<ToolCallRequest>,
        usage: Option<Usage>,
    },
    Cancelled {
        partial: String,
    },
}

enum Attempt {
    Done(Exchange),
    Failed { error: ProviderError, emitted: bool },
}

#[derive(Default)]
struct TurnState {
    batches: u32,
    tool_calls: u32,
    usage: Usage,
}

/// Marks a session as having a turn in flight until dropped.
struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.id);
    }
}

pub struct Orchestrator {
    config: ConfigHandle,
    providers: Arc<ProviderRouter>,
    dispatcher: ToolDispatcher,
    store: Arc<dyn SessionStore>,
    gate: ApprovalGate,
    approver: Arc<dyn Approver>,
    events: Arc<EventBus>,
    busy: Mutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        config: ConfigHandle,
        providers: Arc<ProviderRouter>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn SessionStore>,
        approver: Arc<dyn Approver>,
    ) -> Self {
        Self {
            config,
            providers,
            dispatcher: ToolDispatcher::new(tools),
            store,
            gate: ApprovalGate::default(),
            approver,
            events: Arc::new(EventBus::default()),
            busy: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_gate(mut self, gate: ApprovalGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.dispatcher.registry()
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    /// Start a session with the current snapshot's model, provider and policy.
    pub async fn create_session(&self) -> Result<Session, AgentError> {
        let cfg = self.config.snapshot();
        let session = self
            .store
            .create(SessionSettings {
                model: cfg.model_name(),
                provider: cfg.provider.clone(),
                approval: cfg.approval,
            })
            .await?;
        info!(session_id = %session.id, model = %session.model, "Created session");
        Ok(session)
    }

    /// Switch the session's approval policy. Applies to later calls only.
    ///
    /// Returns `false` when the policy was already in effect.
    pub async fn set_approval(
        &self,
        session: &mut Session,
        policy: ApprovalPolicy,
    ) -> Result<bool, AgentError> {
        match self.gate.policy_change(session, policy) {
            Some(change) => {
                self.store
                    .update(session, SessionUpdate::Policy { change })
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn try_lock(&self, session: &Session) -> Result<BusyGuard<'_>, AgentError> {
        let id = session.id.to_string();
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(id.clone()) {
            return Err(AgentError::Busy(id));
        }
        Ok(BusyGuard {
            busy: &self.busy,
            id,
        })
    }

    /// Run one turn: append `input`, then request and dispatch until the
    /// model answers without tool calls.
    ///
    /// Cancelling `cancel` aborts the in-flight request or tool and ends the
    /// turn with `cancelled = true`; the history stays well formed.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        input: Message,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let _guard = self.try_lock(session)?;
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let cfg = self.config.snapshot();
        let session_id = session.id.to_string();
        info!(session_id = %session_id, provider = %cfg.provider, "Turn started");
        self.events.publish(AgentEvent::TurnStarted {
            session_id: session_id.clone(),
        });

        let result = match self.store.append(session, input).await {
            Ok(()) => self.drive(session, &cfg, cancel).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Turn failed");
                self.events.publish(AgentEvent::TurnFailed {
                    session_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        cfg: &AppConfig,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let provider = self.providers.resolve(cfg)?;
        let caps = provider.capabilities();
        let retry = RetryPolicy::from_config(&cfg.retry);
        let mut state = TurnState::default();

        loop {
            if cancel.is_cancelled() {
                return self.finish(session, cfg, state, String::new(), true).await;
            }

            let request = self.build_request(cfg, caps, session);
            debug!(
                session_id = %session.id,
                model = %request.model,
                messages = request.messages.len(),
                tools = request.tools.len(),
                "Requesting"
            );

            let (text, mut calls) = match self
                .exchange(provider.as_ref(), request, &retry, session, cancel)
                .await?
            {
                Exchange::Cancelled { partial } => {
                    if !partial.is_empty() {
                        let mut message = Message::assistant(partial.clone());
                        message.metadata.insert("truncated".into(), true.into());
                        self.store.append(session, message).await?;
                    }
                    return self.finish(session, cfg, state, partial, true).await;
                }
                Exchange::Reply {
                    text,
                    tool_calls,
                    usage,
                } => {
                    if let Some(usage) = usage {
                        state.usage.add(&usage);
                    }
                    if !text.is_empty() {
                        self.events.publish(AgentEvent::TextComplete {
                            session_id: session.id.to_string(),
                            text: text.clone(),
                        });
                    }
                    (text, tool_calls)
                }
            };

            if calls.is_empty() {
                self.store.append(session, Message::assistant(text.clone())).await?;
                return self.finish(session, cfg, state, text, false).await;
            }

            if state.batches >= cfg.max_tool_batches {
                return Err(AgentError::TurnLimitExceeded {
                    limit: cfg.max_tool_batches,
                });
            }
            state.batches += 1;

            ensure_unique_ids(&mut calls);
            self.store
                .append(
                    session,
                    Message::assistant_with_tool_calls(text, calls.clone()),
                )
                .await?;

            for call in &calls {
                let (result, duration_ms) = self.resolve_call(session, call, cancel).await;
                state.tool_calls += 1;
                self.store
                    .append(session, Message::tool_result(&result))
                    .await?;
                self.completed(session, call, &result, duration_ms);
            }

            if cancel.is_cancelled() {
                return self.finish(session, cfg, state, String::new(), true).await;
            }
        }
    }

    fn build_request(&self, cfg: &AppConfig, caps: Capabilities, session: &Session) -> ProviderRequest {
        let wants_vision = session
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .is_some_and(|m| m.image.is_some());
        let model = if wants_vision {
            cfg.vision_model_name()
        } else {
            cfg.model_name()
        };

        let mut messages = Vec::with_capacity(session.messages.len() + 1);
        if let Some(instructions) = cfg.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(Message::system(instructions));
        }
        messages.extend(session.messages.iter().cloned());

        let mut request = ProviderRequest::new(model, messages);
        request.temperature = cfg.model.temperature;
        request.max_tokens = cfg.model.max_tokens;
        request.stream = caps.streaming;
        if caps.tools && !wants_vision {
            request.tools = self.dispatcher.registry().definitions();
        }
        request
    }

    /// One logical request, retried while nothing has been shown yet.
    async fn exchange(
        &self,
        provider: &dyn Provider,
        request: ProviderRequest,
        retry: &RetryPolicy,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<Exchange, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.attempt(provider, request.clone(), session, cancel).await {
                Attempt::Done(exchange) => {
                    if attempt > 0 {
                        info!(
                            session_id = %session.id,
                            attempt = attempt + 1,
                            "Provider request succeeded after retry"
                        );
                    }
                    return Ok(exchange);
                }
                Attempt::Failed { error, emitted } => {
                    if emitted || !retry.allows(attempt, &error) {
                        return Err(error);
                    }
                    let delay = retry.delay_for(attempt, &error);
                    warn!(
                        session_id = %session.id,
                        attempt = attempt + 1,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retryable provider failure, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Ok(Exchange::Cancelled { partial: String::new() });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        provider: &dyn Provider,
        request: ProviderRequest,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Attempt {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Attempt::Done(Exchange::Cancelled { partial: String::new() });
            }
            started = provider.stream(request) => match started {
                Ok(rx) => rx,
                Err(error) => return Attempt::Failed { error, emitted: false },
            },
        };

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Attempt::Done(Exchange::Cancelled { partial: text });
                }
                next = rx.recv() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                        self.events.publish(AgentEvent::TextDelta {
                            session_id: session.id.to_string(),
                            delta: delta.clone(),
                        });
                        text.push_str(&delta);
                    }
                    tool_calls.extend(chunk.tool_calls);
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    if chunk.done {
                        break;
                    }
                }
                Some(Err(error)) => {
                    return Attempt::Failed {
                        error,
                        emitted: !text.is_empty(),
                    };
                }
                None => {
                    return Attempt::Failed {
                        error: ProviderError::StreamInterrupted(
                            "stream closed before completion".into(),
                        ),
                        emitted: !text.is_empty(),
                    };
                }
            }
        }

        Attempt::Done(Exchange::Reply {
            text,
            tool_calls,
            usage,
        })
    }

    /// Validate, gate and (maybe) execute one call of a batch. Returns the
    /// result and how long the tool ran, zero if it never started.
    async fn resolve_call(
        &self,
        session: &mut Session,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> (ToolResult, u64) {
        if cancel.is_cancelled() {
            return (ToolResult::denied(&call.id, "cancelled"), 0);
        }

        let prepared = match self.dispatcher.prepare(call) {
            Ok(prepared) => prepared,
            Err(result) => return (result, 0),
        };

        let verdict = self
            .gate
            .evaluate(session, call, prepared.declared, prepared.invocation);
        match verdict.decision {
            ApprovalDecision::Allow => self.run(session, prepared, cancel).await,
            ApprovalDecision::Deny => (ToolResult::denied(&call.id, verdict.reason), 0),
            ApprovalDecision::AskUser => {
                let request = ApprovalRequest {
                    session_id: session.id.to_string(),
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    arguments: prepared.arguments.clone(),
                    danger_class: verdict.class,
                };
                self.events.publish(AgentEvent::ApprovalRequested {
                    session_id: request.session_id.clone(),
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    danger_class: verdict.class,
                });

                let response = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (ToolResult::denied(&call.id, "cancelled"), 0),
                    response = self.approver.decide(&request) => response,
                };

                if let Some(change) = self.gate.record_response(session, call, response)
                    && let Err(e) = self
                        .store
                        .update(session, SessionUpdate::Policy { change })
                        .await
                {
                    warn!(session_id = %session.id, error = %e, "Failed to record session approval");
                }

                match response {
                    ApprovalResponse::Deny => (ToolResult::denied(&call.id, "denied by user"), 0),
                    ApprovalResponse::Approve | ApprovalResponse::ApproveAlwaysThisSession => {
                        self.run(session, prepared, cancel).await
                    }
                }
            }
        }
    }

    async fn run(
        &self,
        session: &Session,
        prepared: PreparedCall,
        cancel: &CancellationToken,
    ) -> (ToolResult, u64) {
        self.events.publish(AgentEvent::ToolCallStarted {
            session_id: session.id.to_string(),
            call_id: prepared.call.id.clone(),
            tool: prepared.call.name.clone(),
            arguments: prepared.call.arguments.clone(),
        });

        let started = Instant::now();
        let result = self.dispatcher.dispatch(prepared, cancel).await;
        (result, started.elapsed().as_millis() as u64)
    }

    /// Report a result that was just appended, whether or not the tool ran.
    fn completed(
        &self,
        session: &Session,
        call: &ToolCallRequest,
        result: &ToolResult,
        duration_ms: u64,
    ) {
        let detail = (!result.is_success()).then(|| result.output.clone());
        let outcome = match result.status {
            ToolStatus::Success => AuditOutcome::Allowed,
            ToolStatus::Denied | ToolStatus::Cancelled => AuditOutcome::Denied,
            ToolStatus::Error | ToolStatus::Timeout => AuditOutcome::Failed,
        };
        self.gate.audit().log(
            AuditEvent::ToolCallFinished {
                tool: call.name.clone(),
                call_id: call.id.clone(),
                status: result.status,
            },
            session.id.as_str(),
            outcome,
            detail.clone(),
        );
        self.events.publish(AgentEvent::ToolCallCompleted {
            session_id: session.id.to_string(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            status: result.status,
            detail,
            duration_ms,
        });
    }

    async fn finish(
        &self,
        session: &mut Session,
        cfg: &AppConfig,
        state: TurnState,
        text: String,
        cancelled: bool,
    ) -> Result<TurnOutcome, AgentError> {
        self.store
            .update(
                session,
                SessionUpdate::TurnCompleted {
                    usage: state.usage,
                    tool_calls: state.tool_calls,
                },
            )
            .await?;

        let every = cfg.checkpoint_every_turns;
        if every > 0 && session.stats.turns % every == 0 {
            match self.store.checkpoint(session, None).await {
                Ok(cp) => debug!(session_id = %session.id, checkpoint = %cp.name, "Auto checkpoint"),
                Err(e) => warn!(session_id = %session.id, error = %e, "Auto checkpoint failed"),
            }
        }

        info!(
            session_id = %session.id,
            batches = state.batches,
            tool_calls = state.tool_calls,
            total_tokens = state.usage.total_tokens,
            cancelled,
            "Turn completed"
        );
        self.events.publish(AgentEvent::TurnCompleted {
            session_id: session.id.to_string(),
            batches: state.batches,
            tool_calls: state.tool_calls,
            cancelled,
        });

        Ok(TurnOutcome {
            text,
            batches: state.batches,
            tool_calls: state.tool_calls,
            usage: state.usage,
            cancelled,
        })
    }
}

/// Give every call in a batch a distinct, non-empty id.
fn ensure_unique_ids(calls: &mut [ToolCallRequest]) {
    let mut seen = HashSet::new();
    for call in calls {
        if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
            call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
            seen.insert(call.id.clone());
        }
    }
}
