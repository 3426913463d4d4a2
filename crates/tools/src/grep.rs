//! Grep tool — regex search over a directory tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ignore::WalkBuilder;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};

use crate::context::{ToolContext, required_str};

const DEFAULT_MAX_RESULTS: usize = 200;
const MAX_LINE_CHARS: usize = 300;
/// Files bigger than this are skipped.
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

pub struct GrepTool {
    ctx: Arc<ToolContext>,
}

impl GrepTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching lines as path:line:text. Honors .gitignore."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: working directory)"
                },
                "case_insensitive": { "type": "boolean" },
                "max_results": {
                    "type": "integer",
                    "description": "Stop after this many matches (default 200)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::Safe
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let pattern = required_str(&arguments, "pattern")?;
        let raw = arguments["path"].as_str().unwrap_or(".");
        let root = self.ctx.resolve(self.name(), raw)?;
        let max_results = arguments["max_results"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .max(1);

        let source = if arguments["case_insensitive"].as_bool().unwrap_or(false) {
            format!("(?i){pattern}")
        } else {
            pattern.to_string()
        };
        let regex = regex_lite::Regex::new(&source)
            .map_err(|e| ToolError::InvalidArguments(format!("Invalid pattern: {e}")))?;

        let cwd = self.ctx.cwd();
        let base = std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
        let search = tokio::task::spawn_blocking(move || search(&root, &base, &regex, max_results))
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "grep".into(),
                reason: e.to_string(),
            })?;

        if search.matches.is_empty() {
            return Ok(ToolOutput::ok(format!("No matches for '{pattern}'")));
        }
        let mut output = search.matches.join("\n");
        if search.truncated {
            output.push_str(&format!("\n[stopped after {max_results} matches]"));
        }
        Ok(ToolOutput::ok(output).with_data(serde_json::json!({
            "matches": search.matches.len(),
            "files_scanned": search.files_scanned,
            "truncated": search.truncated,
        })))
    }
}

struct Search {
    matches: Vec<String>,
    files_scanned: usize,
    truncated: bool,
}

fn search(root: &Path, base: &Path, regex: &regex_lite::Regex, max_results: usize) -> Search {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(false)
        .follow_links(false)
        .require_git(false)
        .filter_entry(|e| {
            !matches!(
                e.file_name().to_str(),
                Some(".git" | "target" | "node_modules")
            )
        });

    let mut result = Search {
        matches: Vec::new(),
        files_scanned: 0,
        truncated: false,
    };

    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if entry.metadata().is_ok_and(|m| m.len() > MAX_FILE_BYTES) {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if bytes.contains(&0) {
            continue;
        }
        result.files_scanned += 1;

        let text = String::from_utf8_lossy(&bytes);
        let display = display_path(entry.path(), base);
        for (idx, line) in text.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if result.matches.len() >= max_results {
                result.truncated = true;
                return result;
            }
            let line: String = line.chars().take(MAX_LINE_CHARS).collect();
            result
                .matches
                .push(format!("{}:{}:{}", display, idx + 1, line.trim_end()));
        }
    }
    result
}

fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .map(PathBuf::from)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use termagent_security::PathPolicy;

    fn setup() -> (tempfile::TempDir, GrepTool) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn run() {}\n").unwrap();
        std::fs::write(dir.path().join("target/out.rs"), "fn run() {}\n").unwrap();
        let tool = GrepTool::new(Arc::new(ToolContext::new(dir.path(), PathPolicy::default())));
        (dir, tool)
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let (_dir, tool) = setup();
        let result = tool
            .execute(serde_json::json!({"pattern": r"run\(\)"}))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.contains("src/main.rs:2:    run();"));
        assert!(result.output.contains("src/lib.rs:1:pub fn run() {}"));
        assert!(!result.output.contains("target/"));
    }

    #[tokio::test]
    async fn respects_max_results() {
        let (_dir, tool) = setup();
        let result = tool
            .execute(serde_json::json!({"pattern": "run", "max_results": 1}))
            .await
            .unwrap();
        assert_eq!(result.data.unwrap()["truncated"], true);
        assert!(result.output.contains("[stopped after 1 matches]"));
    }

    #[tokio::test]
    async fn case_insensitive_and_no_match() {
        let (_dir, tool) = setup();
        let result = tool
            .execute(serde_json::json!({"pattern": "FN MAIN", "case_insensitive": true}))
            .await
            .unwrap();
        assert!(result.output.contains("src/main.rs:1"));

        let result = tool
            .execute(serde_json::json!({"pattern": "nothing_here"}))
            .await
            .unwrap();
        assert!(result.output.starts_with("No matches"));
    }

    #[tokio::test]
    async fn invalid_regex_is_an_argument_error() {
        let (_dir, tool) = setup();
        let err = tool
            .execute(serde_json::json!({"pattern": "("}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
