//! termagent — a coding agent for the terminal.
//!
//! Usage:
//! - `termagent`                  — interactive session
//! - `termagent "fix the tests"`  — one prompt, then exit
//! - `termagent sessions`         — list saved sessions
//! - `termagent init`             — write a starter config

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use termagent_config::AppConfig;
use termagent_core::ApprovalPolicy;

mod commands;
mod input;
mod render;

#[derive(Parser)]
#[command(
    name = "termagent",
    about = "termagent — a coding agent for your terminal",
    version,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Prompt to run once; starts the interactive REPL when omitted
    prompt: Option<String>,

    /// Attach an image to the prompt, or to the first REPL message
    #[arg(long)]
    image: Option<PathBuf>,

    /// Working directory the tools operate in
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Chat model
    #[arg(short, long)]
    model: Option<String>,

    /// Model used for prompts with an image
    #[arg(long)]
    vision_model: Option<String>,

    /// LLM provider (ollama, gemini, mistral, openai, groq)
    #[arg(short, long)]
    provider: Option<String>,

    /// API key for the provider
    #[arg(long, env = "TERMAGENT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Approval policy: auto, on-request or never
    #[arg(short, long)]
    approval: Option<ApprovalPolicy>,

    /// Resume a saved session by id
    #[arg(short, long)]
    resume: Option<String>,

    /// Config file (default: ~/.termagent/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved sessions
    Sessions,

    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
    }

    /// Command-line flags win over file and environment.
    fn apply_overrides(&self, config: &mut AppConfig) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(provider) = &self.provider {
            config.set_provider(provider)?;
        }
        if let Some(model) = &self.model {
            config.model.name = Some(model.clone());
        }
        if let Some(model) = &self.vision_model {
            config.model.vision_model = Some(model.clone());
        }
        if let Some(key) = &self.api_key {
            config.api_key = Some(key.clone());
        }
        if let Some(approval) = self.approval {
            config.approval = approval;
        }
        if let Some(cwd) = &self.cwd {
            config.cwd = Some(std::fs::canonicalize(cwd).map_err(|e| {
                format!("working directory {} is not accessible: {e}", cwd.display())
            })?);
        }
        config.validate()?;
        Ok(())
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let path = cli.config_path();
    if let Some(Commands::Init { force }) = cli.command {
        return commands::init::run(&path, force);
    }

    let mut config = AppConfig::load_with_overrides(&path)
        .map_err(|e| format!("Failed to load config: {e}"))?;
    cli.apply_overrides(&mut config)?;

    match cli.command {
        Some(Commands::Sessions) => commands::sessions::run(&config).await,
        Some(Commands::Init { .. }) => Ok(()),
        None => {
            let args = commands::chat::ChatArgs {
                prompt: cli.prompt,
                image: cli.image,
                resume: cli.resume,
            };
            commands::chat::run(config, args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "termagent",
            "--provider",
            "groq",
            "--model",
            "llama-3.3-70b-versatile",
            "--approval",
            "never",
            "hello",
        ]);
        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config).unwrap();
        assert_eq!(config.provider, "groq");
        assert_eq!(config.model_name(), "llama-3.3-70b-versatile");
        assert_eq!(config.approval, ApprovalPolicy::Never);
        assert_eq!(cli.prompt.as_deref(), Some("hello"));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let cli = Cli::parse_from(["termagent", "--provider", "nope"]);
        assert!(cli.apply_overrides(&mut AppConfig::default()).is_err());
    }

    #[test]
    fn image_without_prompt_is_kept_for_the_repl() {
        let cli = Cli::parse_from(["termagent", "--image", "shot.png"]);
        assert!(cli.prompt.is_none());
        assert_eq!(cli.image, Some(PathBuf::from("shot.png")));
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::parse_from(["termagent", "init", "--force"]);
        assert!(matches!(cli.command, Some(Commands::Init { force: true })));
        let cli = Cli::parse_from(["termagent", "sessions"]);
        assert!(matches!(cli.command, Some(Commands::Sessions)));
    }
}
