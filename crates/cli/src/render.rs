//! Prints agent events to the terminal as they happen.

use std::io::Write;

use termagent_core::{AgentEvent, ToolStatus};

/// Turns the event stream of one turn into terminal output.
#[derive(Default)]
pub struct Renderer {
    mid_line: bool,
}

impl Renderer {
    pub fn render(&mut self, event: &AgentEvent) {
        let mut out = std::io::stdout();
        match event {
            AgentEvent::TextDelta { delta, .. } => {
                let _ = write!(out, "{delta}");
                let _ = out.flush();
                self.mid_line = !delta.ends_with('\n');
            }
            AgentEvent::ToolCallStarted {
                tool, arguments, ..
            } => {
                self.end_line();
                println!("  ⚙ {tool} {}", clip(arguments, 120));
            }
            AgentEvent::ToolCallCompleted {
                tool,
                status,
                detail,
                duration_ms,
                ..
            } => {
                self.end_line();
                println!("{}", completion_line(tool, *status, detail.as_deref(), *duration_ms));
            }
            AgentEvent::TurnCompleted { cancelled, .. } => {
                self.end_line();
                if *cancelled {
                    println!("  [cancelled]");
                }
            }
            AgentEvent::TurnFailed { .. } => self.end_line(),
            AgentEvent::TurnStarted { .. }
            | AgentEvent::TextComplete { .. }
            | AgentEvent::ApprovalRequested { .. } => {}
        }
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

fn completion_line(
    tool: &str,
    status: ToolStatus,
    detail: Option<&str>,
    duration_ms: u64,
) -> String {
    let mark = match status {
        ToolStatus::Success => "✓",
        ToolStatus::Denied | ToolStatus::Cancelled => "⊘",
        ToolStatus::Error | ToolStatus::Timeout => "✗",
    };
    let mut line = if duration_ms > 0 || status == ToolStatus::Success {
        format!("  {mark} {tool} {status} ({duration_ms} ms)")
    } else {
        format!("  {mark} {tool} {status}")
    };
    if let Some(detail) = detail.filter(|d| !d.is_empty()) {
        line.push_str(": ");
        line.push_str(&clip(detail, 200));
    }
    line
}

fn clip(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let head: String = flat.chars().take(max).collect();
        format!("{head}…")
    }
}
