//! Shared fixtures for the orchestrator scenario tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use termagent_agent::Orchestrator;
use termagent_config::{AppConfig, ConfigHandle};
use termagent_core::error::{ProviderError, ToolError};
use termagent_core::{
    ApprovalPolicy, ApprovalRequest, ApprovalResponse, Approver, Capabilities, DangerClass,
    Message, Provider, ProviderRequest, ProviderResponse, SessionStore, Tool, ToolCallRequest,
    ToolOutput, ToolRegistry, Usage,
};
use termagent_providers::ProviderRouter;
use termagent_session::InMemorySessionStore;

// ── Scripted provider ───────────────────────────────────────────────────

pub enum Step {
    Reply(ProviderResponse),
    Fail(fn() -> ProviderError),
}

/// A provider that plays back canned replies in order.
///
/// With `repeat_last`, the final reply is served forever once the script
/// runs out, which models a model that never stops calling tools.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<ProviderResponse>>,
    repeat_last: bool,
    capabilities: Capabilities,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            repeat_last: false,
            capabilities: Capabilities {
                tools: true,
                vision: true,
                streaming: false,
            },
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(replies: Vec<ProviderResponse>) -> Self {
        Self::new(replies.into_iter().map(Step::Reply).collect())
    }

    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let next = self.steps.lock().unwrap().pop_front();
        match next {
            Some(Step::Reply(reply)) => {
                *self.last.lock().unwrap() = Some(reply.clone());
                Ok(reply)
            }
            Some(Step::Fail(make)) => Err(make()),
            None if self.repeat_last => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ProviderError::InvalidRequest("empty script".into())),
            None => panic!("ScriptedProvider exhausted"),
        }
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

pub fn text(content: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(content),
        usage: usage(),
        model: "scripted-model".into(),
        metadata: Default::default(),
    }
}

/// A reply requesting `calls`, each given as (id, tool, arguments).
pub fn tool_calls(calls: &[(&str, &str, &str)]) -> ProviderResponse {
    let requests = calls
        .iter()
        .map(|(id, name, args)| ToolCallRequest::new(*id, *name, *args))
        .collect();
    ProviderResponse {
        message: Message::assistant_with_tool_calls("", requests),
        usage: usage(),
        model: "scripted-model".into(),
        metadata: Default::default(),
    }
}

// ── Stub tools ──────────────────────────────────────────────────────────

/// A tool that counts its invocations and echoes its `value` argument.
pub struct StubTool {
    name: &'static str,
    class: DangerClass,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl StubTool {
    pub fn new(name: &'static str, class: DangerClass) -> Self {
        Self {
            name,
            class,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Tool for StubTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Stub tool for tests"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "value": { "type": "string" } },
            "required": ["value"]
        })
    }

    fn danger_class(&self) -> DangerClass {
        self.class
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let value = arguments["value"].as_str().unwrap_or_default();
        Ok(ToolOutput::ok(format!("{}:{value}", self.name)))
    }
}

// ── Scripted approver ───────────────────────────────────────────────────

/// Answers approval prompts from a queue; denies once the queue is empty.
#[derive(Default)]
pub struct ScriptedApprover {
    answers: Mutex<VecDeque<ApprovalResponse>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedApprover {
    pub fn answering(answers: Vec<ApprovalResponse>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Tool names the user was asked about, in order.
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Approver for ScriptedApprover {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalResponse {
        self.asked.lock().unwrap().push(request.tool.clone());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ApprovalResponse::Deny)
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub provider: Arc<ScriptedProvider>,
    pub approver: Arc<ScriptedApprover>,
    pub store: Arc<dyn SessionStore>,
}

pub struct HarnessBuilder {
    provider: ScriptedProvider,
    tools: Vec<Box<dyn Tool>>,
    approver: ScriptedApprover,
    store: Option<Arc<dyn SessionStore>>,
    config: AppConfig,
    approver_override: Option<Arc<dyn Approver>>,
    provider_override: Option<Arc<dyn Provider>>,
}

impl HarnessBuilder {
    pub fn new(provider: ScriptedProvider) -> Self {
        let mut config = AppConfig::default();
        config.retry.max_retries = 0;
        config.checkpoint_every_turns = 0;
        Self {
            provider,
            tools: Vec::new(),
            approver: ScriptedApprover::default(),
            store: None,
            config,
            approver_override: None,
            provider_override: None,
        }
    }

    pub fn tool(mut self, tool: StubTool) -> Self {
        self.tools.push(Box::new(tool));
        self
    }

    pub fn approver(mut self, approver: ScriptedApprover) -> Self {
        self.approver = approver;
        self
    }

    /// Answer approvals with `approver` instead of the scripted queue.
    pub fn approver_impl(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver_override = Some(approver);
        self
    }

    /// Route requests to `provider` instead of the scripted one.
    pub fn provider_impl(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider_override = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn approval(mut self, policy: ApprovalPolicy) -> Self {
        self.config.approval = policy;
        self
    }

    pub fn configure(mut self, edit: impl FnOnce(&mut AppConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn build(self) -> Harness {
        let provider = Arc::new(self.provider);
        let approver = Arc::new(self.approver);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));

        let mut router = ProviderRouter::new();
        let provider_id = self.config.provider.clone();
        let routed = self
            .provider_override
            .unwrap_or_else(|| Arc::clone(&provider) as Arc<dyn Provider>);
        router.register(provider_id, routed);

        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool);
        }

        let orchestrator = Orchestrator::new(
            ConfigHandle::new(self.config),
            Arc::new(router),
            Arc::new(registry),
            Arc::clone(&store),
            self.approver_override
                .unwrap_or_else(|| Arc::clone(&approver) as Arc<dyn Approver>),
        );

        Harness {
            orchestrator,
            provider,
            approver,
            store,
        }
    }
}
