//! Terminal input — stdin lines and the interactive approval prompt.
//!
//! One background task reads stdin. The REPL takes lines between turns
//! and the approver takes them while a turn waits on a prompt, so both
//! share a single [`LineInput`].

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use termagent_core::{ApprovalRequest, ApprovalResponse, Approver};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};

pub struct LineInput {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl LineInput {
    /// Start reading stdin on a background task.
    pub fn stdin() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut lines = BufReader::new(io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Arc::new(Self { rx: Mutex::new(rx) })
    }

    /// Next line, or `None` at end of input.
    pub async fn next_line(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

pub fn prompt(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

/// Asks the user on the terminal.
pub struct TerminalApprover {
    input: Arc<LineInput>,
}

impl TerminalApprover {
    pub fn new(input: Arc<LineInput>) -> Self {
        Self { input }
    }
}

#[async_trait]
impl Approver for TerminalApprover {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalResponse {
        eprintln!();
        eprintln!("  ⚠  {} wants to run ({})", request.tool, request.danger_class);
        for line in describe_arguments(&request.arguments).lines() {
            eprintln!("     {line}");
        }
        loop {
            eprint!("  Allow? [y]es / [a]lways this session / [n]o: ");
            let Some(line) = self.input.next_line().await else {
                return ApprovalResponse::Deny;
            };
            match parse_answer(&line) {
                Some(answer) => return answer,
                None => eprintln!("  Please answer y, a or n."),
            }
        }
    }
}

fn parse_answer(line: &str) -> Option<ApprovalResponse> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalResponse::Approve),
        "a" | "always" => Some(ApprovalResponse::ApproveAlwaysThisSession),
        "n" | "no" | "" => Some(ApprovalResponse::Deny),
        _ => None,
    }
}

/// Arguments as shown in the prompt; long string values are clipped.
fn describe_arguments(arguments: &serde_json::Value) -> String {
    const MAX: usize = 400;
    match arguments.as_object() {
        Some(map) if !map.is_empty() => map
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let clipped: String = text.chars().take(MAX).collect();
                if clipped.len() < text.len() {
                    format!("{key}: {clipped}…")
                } else {
                    format!("{key}: {clipped}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => arguments.to_string(),
    }
}
