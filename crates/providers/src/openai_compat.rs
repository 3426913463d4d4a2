//! OpenAI-compatible provider implementation.
//!
//! Works with every backend in the catalog (Ollama, Gemini, Mistral,
//! OpenAI, Groq) and any other endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling
//! - Image input as base64 `data:` URLs
//! - Model listing

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use termagent_core::error::ProviderError;
use termagent_core::message::{Message, Role, ToolCallRequest};
use termagent_core::provider::*;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Whole-request bound for non-streaming calls, and for the response
/// headers of streaming ones.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// A stream that delivers nothing for this long is considered dead.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    capabilities: Capabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            capabilities: Capabilities {
                tools: true,
                vision: false,
                streaming: true,
            },
            client,
        })
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Result<Self, ProviderError> {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert our Message types to OpenAI API format.
    ///
    /// Images become `image_url` parts when the provider supports vision
    /// and are dropped otherwise.
    fn to_api_messages(&self, messages: &[Message]) -> Result<Vec<ApiMessage>, ProviderError> {
        messages
            .iter()
            .map(|m| {
                let content = match &m.image {
                    Some(image) if self.capabilities.vision => {
                        let bytes = std::fs::read(&image.path).map_err(|e| {
                            ProviderError::InvalidRequest(format!(
                                "cannot read image {}: {e}",
                                image.path.display()
                            ))
                        })?;
                        let mut parts = Vec::with_capacity(2);
                        if !m.content.is_empty() {
                            parts.push(ApiContentPart::Text {
                                text: m.content.clone(),
                            });
                        }
                        parts.push(ApiContentPart::ImageUrl {
                            image_url: ApiImageUrl {
                                url: format!(
                                    "data:{};base64,{}",
                                    image.mime_type,
                                    BASE64.encode(bytes)
                                ),
                            },
                        });
                        Some(ApiContent::Parts(parts))
                    }
                    Some(image) => {
                        warn!(
                            provider = %self.name,
                            image = %image.path.display(),
                            "Provider does not support images, sending text only"
                        );
                        Some(ApiContent::Text(m.content.clone()))
                    }
                    // Assistant messages that only carry tool calls have no content.
                    None if m.content.is_empty() && !m.tool_calls.is_empty() => None,
                    None => Some(ApiContent::Text(m.content.clone())),
                };

                Ok(ApiMessage {
                    role: match m.role {
                        Role::User => "user".into(),
                        Role::Assistant => "assistant".into(),
                        Role::System => "system".into(),
                        Role::Tool => "tool".into(),
                    },
                    content,
                    tool_calls: if m.tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            m.tool_calls
                                .iter()
                                .map(|tc| ApiToolCall {
                                    id: tc.id.clone(),
                                    r#type: "function".into(),
                                    function: ApiFunction {
                                        name: tc.name.clone(),
                                        arguments: tc.arguments.clone(),
                                    },
                                })
                                .collect(),
                        )
                    },
                    tool_call_id: m.tool_call_id.clone(),
                })
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": self.to_api_messages(&request.messages)?,
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() && self.capabilities.tools {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        Ok(body)
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        sse: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if sse {
            // Streamed bodies may legitimately outlive any total timeout;
            // only the wait for the headers is bounded here.
            builder = builder.header("Accept", "text/event-stream");
        } else {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, builder.json(body).send())
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!("no response within {}s", REQUEST_TIMEOUT.as_secs()))
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;
        check_status(response).await
    }
}

/// Map HTTP failures onto provider errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response),
        429 => {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5);
            Err(ProviderError::RateLimited { retry_after_secs })
        }
        401 | 403 => Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        )),
        404 => {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::ModelNotFound(body))
        }
        _ => {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            })
        }
    }
}

fn call_id_or_generated(id: String) -> String {
    if id.is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        id
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.request_body(&request, false)?;
        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post(&body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("No choices in response".into()))?;

        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                ToolCallRequest::new(
                    call_id_or_generated(tc.id),
                    tc.function.name,
                    tc.function.arguments,
                )
            })
            .collect();

        let content = match choice.message.content {
            Some(ApiContent::Text(text)) => text,
            Some(ApiContent::Parts(parts)) => parts
                .into_iter()
                .filter_map(|p| match p {
                    ApiContentPart::Text { text } => Some(text),
                    ApiContentPart::ImageUrl { .. } => None,
                })
                .collect(),
            None => String::new(),
        };

        let usage = api_response.usage.map(Usage::from);

        Ok(ProviderResponse {
            message: Message::assistant_with_tool_calls(content, tool_calls),
            usage,
            model: api_response.model.unwrap_or(request.model),
            metadata: serde_json::Map::new(),
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let body = self.request_body(&request, true)?;
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&body, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Read the SSE byte stream on a task; dropping the receiver ends it.
        tokio::spawn(pump_sse(
            response.bytes_stream(),
            provider_name,
            STREAM_IDLE_TIMEOUT,
            tx,
        ));

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let models = body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}

/// Forward an SSE byte stream as chunks until `[DONE]`, end of stream, a
/// read error, or `idle` without data.
async fn pump_sse<S, B, E>(
    byte_stream: S,
    provider_name: String,
    idle: Duration,
    tx: mpsc::Sender<Result<StreamChunk, ProviderError>>,
) where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut byte_stream = std::pin::pin!(byte_stream);
    let mut lines = SseLines::default();
    let mut assembler = StreamAssembler::default();

    loop {
        let bytes = match tokio::time::timeout(idle, byte_stream.next()).await {
            Ok(Some(Ok(bytes))) => bytes,
            Ok(Some(Err(e))) => {
                let _ = tx
                    .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(provider = %provider_name, "Stream stalled");
                let _ = tx
                    .send(Err(ProviderError::StreamInterrupted(format!(
                        "no data for {}s",
                        idle.as_secs()
                    ))))
                    .await;
                return;
            }
        };

        for line in lines.push(bytes.as_ref()) {
            for chunk in assembler.push_line(&line, &provider_name) {
                let done = chunk.done;
                if tx.send(Ok(chunk)).await.is_err() || done {
                    return;
                }
            }
        }
    }

    if let Some(line) = lines.finish() {
        for chunk in assembler.push_line(&line, &provider_name) {
            let done = chunk.done;
            if tx.send(Ok(chunk)).await.is_err() || done {
                return;
            }
        }
    }

    // Stream ended without [DONE].
    let _ = tx.send(Ok(assembler.finish())).await;
}

/// Splits an SSE byte stream into lines.
///
/// Bytes are buffered until a newline arrives, so a multi-byte character
/// split across network chunks is decoded whole.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            lines.push(decode_line(&line[..end]));
        }
        lines
    }

    /// A trailing line without a newline, if any.
    fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) => {
            warn!(error = %e, "Invalid UTF-8 in stream line");
            String::from_utf8_lossy(bytes).into_owned()
        }
    };
    text.trim_end_matches('\r').to_string()
}

/// Turns SSE `data:` payloads into [`StreamChunk`]s.
///
/// Content deltas pass straight through. Tool-call fragments are
/// accumulated by index and emitted, complete and in index order, with
/// the final chunk.
#[derive(Default)]
struct StreamAssembler {
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    usage: Option<Usage>,
    finished: bool,
}

impl StreamAssembler {
    /// Feed one SSE line; anything but `data:` lines is ignored.
    fn push_line(&mut self, line: &str, provider: &str) -> Vec<StreamChunk> {
        match line.strip_prefix("data:") {
            Some(data) => self.push(data.trim(), provider),
            None => Vec::new(),
        }
    }

    fn push(&mut self, data: &str, provider: &str) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }
        if data == "[DONE]" {
            return vec![self.finish()];
        }

        let stream_resp = match serde_json::from_str::<StreamResponse>(data) {
            Ok(resp) => resp,
            Err(e) => {
                trace!(provider, data, error = %e, "Ignoring unparseable SSE chunk");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        if let Some(choice) = stream_resp.choices.into_iter().next() {
            for tc_delta in choice.delta.tool_calls.unwrap_or_default() {
                let acc = self.tool_calls.entry(tc_delta.index).or_default();
                if let Some(id) = tc_delta.id {
                    acc.id = id;
                }
                if let Some(func) = tc_delta.function {
                    if let Some(name) = func.name {
                        acc.name = name;
                    }
                    if let Some(args) = func.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }

            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(StreamChunk {
                    content: Some(content),
                    ..StreamChunk::default()
                });
            }
        }

        // With include_usage the usage arrives last, on a chunk without choices.
        if let Some(usage) = stream_resp.usage {
            self.usage = Some(usage.into());
            out.push(self.finish());
        }
        out
    }

    fn finish(&mut self) -> StreamChunk {
        self.finished = true;
        StreamChunk {
            content: None,
            tool_calls: std::mem::take(&mut self.tool_calls)
                .into_values()
                .map(ToolCallAccumulator::into_tool_call)
                .collect(),
            done: true,
            usage: self.usage.take(),
        }
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> ToolCallRequest {
        ToolCallRequest::new(call_id_or_generated(self.id), self.name, self.arguments)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<ApiContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiContentPart>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentPart {
    Text { text: String },
    ImageUrl { image_url: ApiImageUrl },
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiImageUrl {
    url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta — arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
