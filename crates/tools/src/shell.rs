//! Shell tool — execute system commands.
//!
//! Commands run through `sh -c` in the session working directory with a
//! filtered environment. The child is killed if the call is dropped, so
//! dispatcher timeouts and cancellation do not leave processes behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use termagent_config::ShellEnvironmentPolicy;
use termagent_core::error::ToolError;
use termagent_core::tool::{DangerClass, Tool, ToolOutput};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::context::{required_str, truncate_output};

const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Execute shell commands in the working directory.
pub struct ShellTool {
    cwd: PathBuf,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl ShellTool {
    /// Build the tool, snapshotting the process environment through `policy`.
    pub fn new(cwd: impl Into<PathBuf>, policy: &ShellEnvironmentPolicy, timeout: Duration) -> Self {
        Self {
            cwd: cwd.into(),
            env: filtered_env(std::env::vars(), policy),
            timeout,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory and return stdout/stderr. Use this for running programs, builds, tests, git operations, etc."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn danger_class(&self) -> DangerClass {
        DangerClass::RequiresApproval
    }

    fn classify(&self, arguments: &serde_json::Value) -> DangerClass {
        match arguments["command"].as_str() {
            Some(command) if is_destructive(command) => DangerClass::AlwaysConfirm,
            _ => DangerClass::RequiresApproval,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let command = required_str(&arguments, "command")?;
        debug!(command = %command, cwd = %self.cwd.display(), "Executing shell command");

        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.cwd)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "shell".into(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        let text = if output.status.success() {
            if stderr.is_empty() {
                stdout.into_owned()
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            warn!(command = %command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };
        let text = truncate_output(text.trim().to_string(), MAX_OUTPUT_BYTES);
        let data = serde_json::json!({ "exit_code": code });

        Ok(if output.status.success() {
            ToolOutput::ok(text).with_data(data)
        } else {
            ToolOutput::failed(text).with_data(data)
        })
    }
}

/// Apply the environment policy to a set of variables.
pub fn filtered_env(
    vars: impl IntoIterator<Item = (String, String)>,
    policy: &ShellEnvironmentPolicy,
) -> HashMap<String, String> {
    let patterns: Vec<regex_lite::Regex> = policy
        .exclude_patterns
        .iter()
        .filter_map(|p| glob_to_regex(p))
        .collect();

    let mut env: HashMap<String, String> = vars
        .into_iter()
        .filter(|(key, _)| !patterns.iter().any(|re| re.is_match(key)))
        .collect();
    env.extend(policy.set_vars.clone());
    env
}

fn glob_to_regex(pattern: &str) -> Option<regex_lite::Regex> {
    let body = pattern
        .split('*')
        .map(regex_lite::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match regex_lite::Regex::new(&format!("(?i)^{body}$")) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Ignoring invalid exclude pattern");
            None
        }
    }
}

/// Whether any simple command in a command line is a known destructive
/// operation. Subshells, brace groups, command substitutions, wrapper
/// programs and `sh -c` scripts are looked through.
pub fn is_destructive(command: &str) -> bool {
    is_destructive_at(command, 0)
}

/// Nested `sh -c` scripts deeper than this are treated as destructive.
const MAX_SCRIPT_DEPTH: usize = 4;

fn is_destructive_at(command: &str, depth: usize) -> bool {
    if depth > MAX_SCRIPT_DEPTH {
        return true;
    }
    split_commands(command)
        .iter()
        .any(|words| command_is_destructive(words, depth))
}

/// Split a command line into simple commands, each a list of words.
///
/// Quotes group words and are removed; `; | & ( ) { }`, backticks, `$(`
/// and newlines end a command.
fn split_commands(line: &str) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut nested = Vec::new();
    let mut chars = line.chars().peekable();

    fn end_word(words: &mut Vec<String>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            words.push(std::mem::take(word));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    word.push(next);
                    in_word = true;
                }
            }
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    word.push(q);
                }
            }
            '"' => {
                in_word = true;
                let mut quoted = String::new();
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                quoted.push(next);
                            }
                        }
                        _ => quoted.push(q),
                    }
                }
                // Substitutions still run inside double quotes.
                if quoted.contains("$(") || quoted.contains('`') {
                    nested.extend(split_commands(&quoted));
                }
                word.push_str(&quoted);
            }
            '$' if chars.peek() == Some(&'(') => {
                chars.next();
                end_word(&mut words, &mut word, &mut in_word);
                commands.push(std::mem::take(&mut words));
            }
            ';' | '|' | '&' | '(' | ')' | '{' | '}' | '`' | '\n' => {
                end_word(&mut words, &mut word, &mut in_word);
                commands.push(std::mem::take(&mut words));
            }
            c if c.is_whitespace() => end_word(&mut words, &mut word, &mut in_word),
            c => {
                word.push(c);
                in_word = true;
            }
        }
    }
    end_word(&mut words, &mut word, &mut in_word);
    commands.push(words);
    commands.extend(nested);
    commands.retain(|w| !w.is_empty());
    commands
}

/// Programs that run another command given as their arguments.
fn wrapped_options(program: &str) -> Option<&'static [&'static str]> {
    match program {
        "sudo" | "doas" => Some(&["-u", "-g", "-C", "-h", "-p"]),
        "env" => Some(&["-u", "-C", "-S", "--unset", "--chdir"]),
        "nice" => Some(&["-n", "--adjustment"]),
        "timeout" => Some(&["-s", "-k", "--signal", "--kill-after"]),
        "xargs" => Some(&["-I", "-n", "-P", "-L", "-d", "-a", "-E", "-s"]),
        "exec" | "nohup" | "time" | "command" | "builtin" | "stdbuf" | "setsid" => Some(&[]),
        _ => None,
    }
}

fn is_shell(program: &str) -> bool {
    matches!(program, "sh" | "bash" | "zsh" | "dash" | "ksh")
}

fn basename(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn command_is_destructive(words: &[String], depth: usize) -> bool {
    let mut rest = words;
    loop {
        let Some(first) = rest.first() else {
            return false;
        };
        let program = basename(first);
        if first.contains('=') && !first.starts_with('-') {
            rest = &rest[1..];
            continue;
        }
        let Some(value_options) = wrapped_options(program) else {
            break;
        };
        rest = &rest[1..];
        // Options of the wrapper, then its positional arguments (a
        // `timeout` duration, a `nice` level) until the wrapped program.
        while let Some(word) = rest.first() {
            if value_options.contains(&word.as_str()) {
                rest = rest.get(2..).unwrap_or(&[]);
            } else if word.starts_with('-') || word.contains('=') || is_duration(word) {
                rest = &rest[1..];
            } else {
                break;
            }
        }
    }

    let program = basename(&rest[0]);
    let args = &rest[1..];

    if is_shell(program) {
        return shell_script(args).is_some_and(|script| is_destructive_at(script, depth + 1));
    }

    match program {
        "rm" => {
            let flags: Vec<&str> = args
                .iter()
                .map(String::as_str)
                .filter(|a| a.starts_with('-'))
                .collect();
            let recursive = flags.iter().any(|f| {
                *f == "--recursive" || (!f.starts_with("--") && (f.contains('r') || f.contains('R')))
            });
            let force = flags
                .iter()
                .any(|f| *f == "--force" || (!f.starts_with("--") && f.contains('f')));
            recursive && force
        }
        "git" => git_subcommand(args).is_some_and(|(sub, rest)| {
            sub == "reset" && rest.iter().any(|a| a == "--hard")
        }),
        "dd" => true,
        p => p.starts_with("mkfs"),
    }
}

/// The script passed to a shell with `-c` (also `-lc`, `-ec`, ...).
fn shell_script(args: &[String]) -> Option<&str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.starts_with('-') && !arg.starts_with("--") && arg.contains('c') {
            return iter.next().map(String::as_str);
        }
        if !arg.starts_with('-') {
            return None;
        }
    }
    None
}

/// Skip git's global options and return the subcommand with its arguments.
fn git_subcommand(args: &[String]) -> Option<(&str, &[String])> {
    let mut i = 0;
    while let Some(arg) = args.get(i) {
        match arg.as_str() {
            "-C" | "-c" | "--git-dir" | "--work-tree" | "--namespace" => i += 2,
            a if a.starts_with('-') => i += 1,
            sub => return Some((sub, &args[i + 1..])),
        }
    }
    None
}

fn is_duration(word: &str) -> bool {
    let digits = word.trim_end_matches(['s', 'm', 'h', 'd']);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
}
