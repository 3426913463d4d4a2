//! Built-in tool implementations for termagent.
//!
//! Tools give the agent the ability to act on the working directory:
//! read, list, search, write, edit and delete files, run shell commands,
//! and fetch web pages. Tools served by external MCP processes are
//! bridged in through [`mcp`].

pub mod context;
pub mod file_delete;
pub mod file_edit;
pub mod file_read;
pub mod file_write;
pub mod grep;
pub mod list_dir;
pub mod mcp;
pub mod shell;
pub mod web_fetch;

use std::sync::Arc;

use termagent_config::AppConfig;
use termagent_core::tool::{Tool, ToolRegistry};
use termagent_security::PathPolicy;

pub use context::ToolContext;
pub use mcp::{McpClient, McpServer, McpTool};

/// Registry of the built-in tools, configured from `config`.
///
/// File tools share one [`ToolContext`] rooted at the working directory
/// with `forbidden_paths` enforced and, unless `restrict_to_cwd` is off,
/// confined to the working directory and `extra_roots`. The allowlist is
/// not applied here.
pub fn builtin_registry(config: &AppConfig) -> ToolRegistry {
    let cwd = config.working_dir();
    let ctx = Arc::new(ToolContext::new(cwd.clone(), path_policy(config, &cwd)));

    let mut registry = ToolRegistry::new().with_default_timeout(config.tools.default_timeout());
    registry.register(Box::new(file_read::ReadFileTool::new(Arc::clone(&ctx))));
    registry.register(Box::new(list_dir::ListDirTool::new(Arc::clone(&ctx))));
    registry.register(Box::new(grep::GrepTool::new(Arc::clone(&ctx))));
    registry.register(Box::new(file_write::WriteFileTool::new(Arc::clone(&ctx))));
    registry.register(Box::new(file_edit::EditFileTool::new(Arc::clone(&ctx))));
    registry.register(Box::new(file_delete::DeleteFileTool::new(ctx)));
    registry.register(Box::new(shell::ShellTool::new(
        cwd,
        &config.shell_environment,
        config.tools.shell_timeout(),
    )));
    registry.register(Box::new(web_fetch::WebFetchTool::new(
        config.tools.web_fetch_max_bytes,
    )));
    registry
}

fn path_policy(config: &AppConfig, cwd: &std::path::Path) -> PathPolicy {
    let policy = PathPolicy::new(&config.tools.forbidden_paths);
    if !config.tools.restrict_to_cwd {
        return policy;
    }
    let mut roots = vec![cwd.to_string_lossy().into_owned()];
    roots.extend(config.tools.extra_roots.iter().cloned());
    policy.with_allowed_roots(&roots)
}

/// Everything the agent can call: built-ins, bridged MCP tools, and the
/// server handles that keep the bridged tools alive.
pub struct Toolset {
    pub registry: Arc<ToolRegistry>,
    pub mcp_servers: Vec<McpServer>,
}

impl Toolset {
    pub async fn shutdown(&self) {
        for server in &self.mcp_servers {
            server.client.shutdown().await;
        }
    }
}

/// Built-ins plus every reachable MCP server, filtered by `allowed_tools`.
pub async fn build_toolset(config: &AppConfig) -> Toolset {
    let mut registry = builtin_registry(config);
    let mcp_servers = mcp::connect_all(&config.mcp_servers, &config.working_dir()).await;
    for server in &mcp_servers {
        for tool in server.adapters() {
            if registry.get(tool.name()).is_some() {
                tracing::warn!(tool = %tool.name(), "MCP tool shadows an existing tool; skipping");
                continue;
            }
            registry.register(Box::new(tool));
        }
    }
    registry.retain(&config.tools.allowed_tools);
    Toolset {
        registry: Arc::new(registry),
        mcp_servers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termagent_core::error::ToolError;
    use termagent_core::tool::DangerClass;

    fn config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            cwd: Some(dir.to_path_buf()),
            ..AppConfig::default()
        }
    }

    #[test]
    fn builtin_registry_has_all_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = builtin_registry(&config(dir.path()));
        assert_eq!(
            registry.names(),
            vec![
                "delete_file",
                "edit_file",
                "grep",
                "list_dir",
                "read_file",
                "shell",
                "web_fetch",
                "write_file",
            ]
        );
    }

    #[test]
    fn danger_classes_are_declared() {
        let dir = tempfile::tempdir().unwrap();
        let registry = builtin_registry(&config(dir.path()));
        let class = |name: &str| registry.descriptor(name).unwrap().danger_class;
        assert_eq!(class("read_file"), DangerClass::Safe);
        assert_eq!(class("list_dir"), DangerClass::Safe);
        assert_eq!(class("grep"), DangerClass::Safe);
        assert_eq!(class("write_file"), DangerClass::RequiresApproval);
        assert_eq!(class("edit_file"), DangerClass::RequiresApproval);
        assert_eq!(class("shell"), DangerClass::RequiresApproval);
        assert_eq!(class("web_fetch"), DangerClass::RequiresApproval);
        assert_eq!(class("delete_file"), DangerClass::AlwaysConfirm);
    }

    #[test]
    fn timeouts_come_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.tools.default_timeout_secs = 7;
        cfg.tools.shell_timeout_secs = 9;
        let registry = builtin_registry(&cfg);
        assert_eq!(registry.descriptor("read_file").unwrap().timeout.as_secs(), 7);
        assert_eq!(registry.descriptor("shell").unwrap().timeout.as_secs(), 9);
    }

    #[tokio::test]
    async fn file_tools_stay_inside_the_working_directory() {
        let outer = tempfile::tempdir().unwrap();
        let project = outer.path().join("project");
        let extra = outer.path().join("shared");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::create_dir_all(&extra).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "nope").unwrap();
        std::fs::write(extra.join("notes.txt"), "shared notes").unwrap();

        let mut cfg = config(&project);
        cfg.tools.extra_roots = vec![extra.to_string_lossy().into_owned()];
        let registry = builtin_registry(&cfg);
        let read = registry.get("read_file").unwrap();
        let write = registry.get("write_file").unwrap();

        let escaped = read
            .execute(serde_json::json!({"path": "../secret.txt"}))
            .await;
        assert!(matches!(escaped, Err(ToolError::PermissionDenied { .. })));

        let written = write
            .execute(serde_json::json!({"path": "/etc/termagent-test", "content": "x"}))
            .await;
        assert!(matches!(written, Err(ToolError::PermissionDenied { .. })));

        let inside = write
            .execute(serde_json::json!({"path": "src/new.rs", "content": "fn main() {}"}))
            .await
            .unwrap();
        assert!(inside.success);
        assert!(project.join("src/new.rs").exists());

        let shared = read
            .execute(serde_json::json!({"path": extra.join("notes.txt").to_string_lossy()}))
            .await
            .unwrap();
        assert!(shared.output.contains("shared notes"));
    }

    #[tokio::test]
    async fn unrestricted_tools_reach_outside_paths() {
        let outer = tempfile::tempdir().unwrap();
        let project = outer.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(outer.path().join("sibling.txt"), "hello").unwrap();

        let mut cfg = config(&project);
        cfg.tools.restrict_to_cwd = false;
        let read = builtin_registry(&cfg).get("read_file").unwrap();
        let result = read
            .execute(serde_json::json!({"path": "../sibling.txt"}))
            .await
            .unwrap();
        assert!(result.output.contains("hello"));
    }

    #[tokio::test]
    async fn toolset_applies_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.tools.allowed_tools = vec!["read_file".into(), "grep".into()];
        let toolset = build_toolset(&cfg).await;
        assert_eq!(toolset.registry.names(), vec!["grep", "read_file"]);
        assert!(toolset.mcp_servers.is_empty());
    }
}
