//! Web fetch tool — HTTP GET with a response size cap.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};
use tracing::debug;

use crate::context::required_str;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebFetchTool {
    client: reqwest::Client,
    max_bytes: usize,
}

impl WebFetchTool {
    pub fn new(max_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("termagent/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client, max_bytes }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return the status and response body as text. Large bodies are truncated."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http:// or https:// URL to fetch"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::RequiresApproval
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let url = required_str(&arguments, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "URL must start with http:// or https://".into(),
            ));
        }

        debug!(url = %url, "Fetching URL");
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return Ok(ToolOutput::failed(format!("Request to {url} failed: {e}"))),
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut body = Vec::new();
        let mut truncated = false;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return Ok(ToolOutput::failed(format!("Reading {url} failed: {e}"))),
            };
            let room = self.max_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        let mut text = String::from_utf8_lossy(&body).into_owned();
        if truncated {
            text.push_str(&format!("\n[body truncated at {} bytes]", self.max_bytes));
        }
        let output = format!("HTTP {}\n\n{text}", status.as_u16());
        let data = serde_json::json!({
            "status": status.as_u16(),
            "content_type": content_type,
            "bytes": body.len(),
            "truncated": truncated,
        });

        Ok(if status.is_success() {
            ToolOutput::ok(output).with_data(data)
        } else {
            ToolOutput::failed(output).with_data(data)
        })
    }
}
