//! Configuration loading, validation, and management for termagent.
//!
//! Loads configuration from `~/.termagent/config.toml` with environment
//! variable overrides, validates it at startup, and hands it out as
//! immutable snapshots through [`ConfigHandle`].

pub mod catalog;
mod handle;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use termagent_core::ApprovalPolicy;

pub use catalog::{ModelInfo, ModelKind, ProviderSpec};
pub use handle::ConfigHandle;

/// The root configuration structure.
///
/// Maps directly to `~/.termagent/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Active provider id (see [`catalog::PROVIDERS`])
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for the active provider; environment variables are used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Endpoint override for the active provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default)]
    pub approval: ApprovalPolicy,

    /// Maximum tool-call batches in a single turn
    #[serde(default = "default_max_tool_batches")]
    pub max_tool_batches: u32,

    /// Take an automatic checkpoint every N completed turns (0 = off)
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every_turns: u32,

    /// Extra instructions sent as a system message ahead of the history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Where sessions are stored (default: `~/.termagent/sessions`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,

    /// Working directory for tools (default: process cwd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub shell_environment: ShellEnvironmentPolicy,

    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

fn default_provider() -> String {
    "ollama".into()
}
fn default_max_tool_batches() -> u32 {
    50
}
fn default_checkpoint_every() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("provider", &self.provider)
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("approval", &self.approval)
            .field("max_tool_batches", &self.max_tool_batches)
            .field("checkpoint_every_turns", &self.checkpoint_every_turns)
            .field("instructions", &self.instructions.as_ref().map(|_| "[set]"))
            .field("retry", &self.retry)
            .field("tools", &self.tools)
            .field("shell_environment", &self.shell_environment)
            .field("mcp_servers", &self.mcp_servers)
            .field("sessions_dir", &self.sessions_dir)
            .field("cwd", &self.cwd)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Chat model; the provider's default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Model used for requests carrying an image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_model: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_context_window")]
    pub context_window: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_context_window() -> u32 {
    32_000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: None,
            vision_model: None,
            temperature: default_temperature(),
            context_window: default_context_window(),
            max_tokens: None,
        }
    }
}

/// Backoff settings for retryable provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// If non-empty, only these tools are offered and dispatchable
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    #[serde(default = "default_tool_timeout")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,

    /// Largest response body `web_fetch` will read
    #[serde(default = "default_fetch_bytes")]
    pub web_fetch_max_bytes: usize,

    /// Paths file tools may never touch
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,

    /// Keep file tools inside the working directory (plus `extra_roots`)
    #[serde(default = "default_true")]
    pub restrict_to_cwd: bool,

    /// Additional directories file tools may reach
    #[serde(default)]
    pub extra_roots: Vec<String>,
}

fn default_tool_timeout() -> u64 {
    60
}
fn default_shell_timeout() -> u64 {
    120
}
fn default_fetch_bytes() -> usize {
    1_000_000
}
fn default_forbidden_paths() -> Vec<String> {
    vec![
        "/proc".into(),
        "/sys".into(),
        "~/.ssh".into(),
        "~/.gnupg".into(),
        "~/.aws".into(),
    ]
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed_tools: Vec::new(),
            default_timeout_secs: default_tool_timeout(),
            shell_timeout_secs: default_shell_timeout(),
            web_fetch_max_bytes: default_fetch_bytes(),
            forbidden_paths: default_forbidden_paths(),
            restrict_to_cwd: true,
            extra_roots: Vec::new(),
        }
    }
}

impl ToolsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }
}

/// Which variables shell subprocesses inherit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellEnvironmentPolicy {
    /// Glob patterns (`*` wildcard, case-insensitive) of variables to strip
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Variables forced into every shell environment
    #[serde(default)]
    pub set_vars: HashMap<String, String>,
}

fn default_exclude_patterns() -> Vec<String> {
    vec!["*KEY*".into(), "*TOKEN*".into(), "*SECRET*".into()]
}

impl Default for ShellEnvironmentPolicy {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            set_vars: HashMap::new(),
        }
    }
}

/// A stdio MCP server whose tools are bridged into the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

fn default_startup_timeout() -> u64 {
    10
}

impl AppConfig {
    /// Load configuration from the default path (~/.termagent/config.toml),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_overrides(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_overrides(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `TERMAGENT_*` and `BASE_URL` overrides read through `env`.
    ///
    /// A provider override resets the models to that provider's defaults
    /// before `TERMAGENT_MODEL` is applied.
    pub fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = env("TERMAGENT_PROVIDER").filter(|p| !p.is_empty())
            && !provider.eq_ignore_ascii_case(&self.provider)
        {
            self.set_provider(&provider)?;
        }

        if let Some(model) = env("TERMAGENT_MODEL").filter(|m| !m.is_empty()) {
            self.model.name = Some(model);
        }

        if let Some(approval) = env("TERMAGENT_APPROVAL").filter(|a| !a.is_empty()) {
            self.approval = approval.parse().map_err(ConfigError::ValidationError)?;
        }

        if let Some(url) = env("BASE_URL").filter(|u| !u.is_empty()) {
            self.base_url = Some(url);
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".termagent")
    }

    /// Directory holding session logs and checkpoints.
    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("sessions"))
    }

    /// Working directory tools operate in.
    pub fn working_dir(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Catalog entry of the active provider.
    pub fn provider_spec(&self) -> Result<&'static ProviderSpec, ConfigError> {
        catalog::lookup(&self.provider).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "unknown provider '{}' (expected one of: {})",
                self.provider,
                catalog::provider_ids().join(", ")
            ))
        })
    }

    /// Switch provider, resetting both models and any explicit endpoint
    /// or key to that provider's defaults.
    pub fn set_provider(&mut self, provider: &str) -> Result<(), ConfigError> {
        let spec = catalog::lookup(provider).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "unknown provider '{provider}' (expected one of: {})",
                catalog::provider_ids().join(", ")
            ))
        })?;
        self.provider = spec.id.to_string();
        self.model.name = None;
        self.model.vision_model = None;
        self.base_url = None;
        self.api_key = None;
        Ok(())
    }

    /// The chat model in effect.
    pub fn model_name(&self) -> String {
        self.model.name.clone().unwrap_or_else(|| {
            catalog::lookup(&self.provider)
                .map(|p| p.default_model.to_string())
                .unwrap_or_default()
        })
    }

    /// The vision model in effect.
    pub fn vision_model_name(&self) -> String {
        self.model.vision_model.clone().unwrap_or_else(|| {
            catalog::lookup(&self.provider)
                .map(|p| p.vision_model.to_string())
                .unwrap_or_else(|| self.model_name())
        })
    }

    /// Endpoint in effect: explicit override, else the catalog URL.
    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| catalog::lookup(&self.provider).map(|p| p.base_url.to_string()))
    }

    /// API key in effect, reading the process environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|key| std::env::var(key).ok())
    }

    /// API key in effect: explicit key, then the provider's own variable,
    /// then `API_KEY`, then the provider's default key.
    pub fn resolve_api_key_with<F>(&self, env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        let spec = catalog::lookup(&self.provider)?;
        env(spec.env_key)
            .filter(|k| !k.is_empty())
            .or_else(|| env("API_KEY").filter(|k| !k.is_empty()))
            .or_else(|| spec.default_key.map(str::to_string))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.max_tool_batches == 0 {
            return Err(ConfigError::ValidationError(
                "max_tool_batches must be at least 1".into(),
            ));
        }

        self.provider_spec()?;

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }

        if self.tools.default_timeout_secs == 0 || self.tools.shell_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tool timeouts must be at least one second".into(),
            ));
        }

        for (name, server) in &self.mcp_servers {
            if server.command.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "mcp_servers.{name}.command must not be empty"
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `termagent init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            base_url: None,
            model: ModelConfig::default(),
            approval: ApprovalPolicy::default(),
            max_tool_batches: default_max_tool_batches(),
            checkpoint_every_turns: default_checkpoint_every(),
            instructions: None,
            retry: RetryConfig::default(),
            tools: ToolsConfig::default(),
            shell_environment: ShellEnvironmentPolicy::default(),
            mcp_servers: BTreeMap::new(),
            sessions_dir: None,
            cwd: None,
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for termagent_core::Error {
    fn from(err: ConfigError) -> Self {
        termagent_core::Error::Config {
            message: err.to_string(),
        }
    }
}
