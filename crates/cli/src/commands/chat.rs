//! `termagent [prompt]` — one-shot prompts and the interactive REPL.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use termagent_agent::{AgentError, Orchestrator, TurnOutcome};
use termagent_config::{AppConfig, ConfigHandle, catalog};
use termagent_core::{ImageRef, Message, Session, SessionId, SessionStore, SessionUpdate};
use termagent_providers::ProviderRouter;
use termagent_session::FileSessionStore;
use termagent_tools::{Toolset, build_toolset};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use super::slash::{self, SlashCommand};
use crate::input::{LineInput, TerminalApprover, prompt};
use crate::render::Renderer;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

pub struct ChatArgs {
    pub prompt: Option<String>,
    pub image: Option<PathBuf>,
    pub resume: Option<String>,
}

pub async fn run(config: AppConfig, args: ChatArgs) -> CliResult<()> {
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(config.sessions_dir()));
    let toolset = build_toolset(&config).await;
    let providers = Arc::new(ProviderRouter::new());
    let input = LineInput::stdin();

    let orchestrator = Orchestrator::new(
        ConfigHandle::new(config),
        Arc::clone(&providers),
        Arc::clone(&toolset.registry),
        store,
        Arc::new(TerminalApprover::new(Arc::clone(&input))),
    );

    let session = match &args.resume {
        Some(id) => {
            let session = orchestrator
                .store()
                .resume(&SessionId::from(id.as_str()))
                .await?;
            adopt_settings(orchestrator.config(), &session)?;
            session
        }
        None => orchestrator.create_session().await?,
    };

    let mut chat = Chat {
        orchestrator,
        providers,
        toolset,
        session,
        input,
        pending_image: None,
    };

    let result = match args.prompt {
        Some(text) => chat.one_shot(text, args.image).await,
        None => {
            // An --image without a prompt goes with the first REPL message.
            chat.pending_image = args.image.map(checked_image).transpose()?;
            chat.repl().await
        }
    };
    chat.toolset.shutdown().await;
    result
}

/// Make the config snapshot match a resumed session's model and provider.
fn adopt_settings(config: &ConfigHandle, session: &Session) -> CliResult<()> {
    let current = config.snapshot();
    if current.provider == session.provider && current.model_name() == session.model {
        return Ok(());
    }
    let mut draft = AppConfig::clone(&current);
    if draft.provider != session.provider {
        draft.set_provider(&session.provider)?;
    }
    draft.model.name = Some(session.model.clone());
    config.publish(draft)?;
    Ok(())
}

fn checked_image(path: PathBuf) -> CliResult<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("image not found: {}", path.display()).into())
    }
}

fn user_message(text: impl Into<String>, image: Option<&Path>) -> Message {
    match image {
        Some(path) => Message::user_with_image(text, ImageRef::from_path(path)),
        None => Message::user(text),
    }
}

struct Chat {
    orchestrator: Orchestrator,
    providers: Arc<ProviderRouter>,
    toolset: Toolset,
    session: Session,
    input: Arc<LineInput>,
    /// Image attached to the next REPL message
    pending_image: Option<PathBuf>,
}

impl Chat {
    async fn one_shot(&mut self, text: String, image: Option<PathBuf>) -> CliResult<()> {
        let image = image.map(checked_image).transpose()?;
        self.turn(user_message(text, image.as_deref())).await?;
        Ok(())
    }

    async fn repl(&mut self) -> CliResult<()> {
        self.banner();
        loop {
            prompt("\n> ");
            let line = tokio::select! {
                line = self.input.next_line() => line,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match slash::parse(line) {
                Some(Ok(SlashCommand::Exit)) => break,
                Some(Ok(command)) => {
                    if let Err(e) = self.command(command).await {
                        eprintln!("  [error] {e}");
                    }
                }
                Some(Err(usage)) => eprintln!("  {usage}"),
                None => {
                    let image = self.pending_image.take();
                    match self.turn(user_message(line, image.as_deref())).await {
                        Ok(_) => {}
                        Err(e) if e.is_recoverable() => eprintln!("  [error] {e}"),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        println!("  Session saved as {}", self.session.id);
        Ok(())
    }

    fn banner(&self) {
        let cfg = self.orchestrator.config().snapshot();
        println!();
        println!("  termagent {}", env!("CARGO_PKG_VERSION"));
        println!("  Provider:  {}", cfg.provider);
        println!("  Model:     {}", cfg.model_name());
        println!("  Approval:  {}", self.session.approval);
        println!("  Directory: {}", cfg.working_dir().display());
        println!("  Session:   {}", self.session.id);
        println!("  Tools:     {}", self.orchestrator.tools().names().join(", "));
        println!();
        println!("  Type /help for commands, Ctrl+C to interrupt, /exit to quit.");
    }

    /// Run one turn, rendering its events and cancelling on Ctrl-C.
    async fn turn(&mut self, message: Message) -> Result<TurnOutcome, AgentError> {
        let cancel = CancellationToken::new();
        let mut events = self.orchestrator.events().subscribe();
        let mut renderer = Renderer::default();

        let turn = self.orchestrator.run_turn(&mut self.session, message, &cancel);
        tokio::pin!(turn);
        let result = loop {
            tokio::select! {
                biased;
                event = events.recv() => {
                    if let Ok(event) = event {
                        renderer.render(&event);
                    }
                }
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    eprintln!("\n  interrupting…");
                    cancel.cancel();
                }
                result = &mut turn => break result,
            }
        };
        loop {
            match events.try_recv() {
                Ok(event) => renderer.render(&event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        result
    }

    async fn command(&mut self, command: SlashCommand) -> CliResult<()> {
        let store = Arc::clone(self.orchestrator.store());
        let config = self.orchestrator.config().clone();
        match command {
            SlashCommand::Help => println!("{}", slash::HELP),
            SlashCommand::Config => {
                let cfg = config.snapshot();
                println!("  provider        {}", cfg.provider);
                println!("  model           {}", cfg.model_name());
                println!("  vision model    {}", cfg.vision_model_name());
                println!("  temperature     {}", cfg.model.temperature);
                println!("  approval        {}", self.session.approval);
                println!("  max batches     {}", cfg.max_tool_batches);
                println!(
                    "  base url        {}",
                    cfg.resolved_base_url().unwrap_or_default()
                );
                println!(
                    "  api key         {}",
                    if cfg.resolve_api_key().is_some() { "set" } else { "missing" }
                );
                println!("  working dir     {}", cfg.working_dir().display());
                println!("  sessions dir    {}", cfg.sessions_dir().display());
            }
            SlashCommand::Provider(None) => {
                let cfg = config.snapshot();
                println!("  Active provider: {}", cfg.provider);
                println!("  Available: {}", catalog::provider_ids().join(", "));
            }
            SlashCommand::Provider(Some(id)) => {
                let mut draft = AppConfig::clone(&config.snapshot());
                draft.set_provider(&id)?;
                let next = config.publish(draft)?;
                store
                    .update(
                        &mut self.session,
                        SessionUpdate::Settings {
                            model: Some(next.model_name()),
                            provider: Some(next.provider.clone()),
                        },
                    )
                    .await?;
                println!("  Provider: {} (model {})", next.provider, next.model_name());
            }
            SlashCommand::Model(None) => {
                println!("  Model: {}", config.snapshot().model_name());
            }
            SlashCommand::Model(Some(name)) => {
                let next = config.update(|c| c.model.name = Some(name.clone()))?;
                store
                    .update(
                        &mut self.session,
                        SessionUpdate::Settings {
                            model: Some(next.model_name()),
                            provider: None,
                        },
                    )
                    .await?;
                println!("  Model: {}", next.model_name());
            }
            SlashCommand::Vision(None) => {
                println!("  Vision model: {}", config.snapshot().vision_model_name());
            }
            SlashCommand::Vision(Some(name)) => {
                let next = config.update(|c| c.model.vision_model = Some(name.clone()))?;
                println!("  Vision model: {}", next.vision_model_name());
            }
            SlashCommand::Image(None) => match &self.pending_image {
                Some(path) => println!("  Next message carries {}", path.display()),
                None => println!("  No image attached"),
            },
            SlashCommand::Image(Some(path)) => {
                let path = checked_image(PathBuf::from(path))?;
                println!(
                    "  Attached {} (sent with your next message via {})",
                    path.display(),
                    config.snapshot().vision_model_name()
                );
                self.pending_image = Some(path);
            }
            SlashCommand::Models => {
                let cfg = config.snapshot();
                let spec = cfg.provider_spec()?;
                for model in spec.models {
                    println!(
                        "  {:<28} {:<8} {}",
                        model.name,
                        model.kind.to_string(),
                        model.description
                    );
                }
                if let Ok(provider) = self.providers.resolve(&cfg) {
                    match provider.list_models().await {
                        Ok(remote) if !remote.is_empty() => {
                            println!("  Served by {}: {}", cfg.provider, remote.join(", "));
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "Listing remote models failed"),
                    }
                }
            }
            SlashCommand::Approval(None) => {
                println!("  Approval policy: {}", self.session.approval);
                let overrides = self.session.session_overrides();
                if !overrides.is_empty() {
                    let mut tools: Vec<_> = overrides.into_iter().collect();
                    tools.sort();
                    println!("  Approved for this session: {}", tools.join(", "));
                }
            }
            SlashCommand::Approval(Some(policy)) => {
                if self
                    .orchestrator
                    .set_approval(&mut self.session, policy)
                    .await?
                {
                    println!("  Approval policy: {policy} (applies to new tool calls)");
                } else {
                    println!("  Approval policy already {policy}");
                }
            }
            SlashCommand::Tools => {
                for d in self.orchestrator.tools().descriptors() {
                    println!(
                        "  {:<24} {:<18} {:>4}s  {}",
                        d.name,
                        d.danger_class.to_string(),
                        d.timeout.as_secs(),
                        first_line(&d.description)
                    );
                }
            }
            SlashCommand::Stats => {
                let stats = &self.session.stats;
                println!("  Session:     {}", self.session.id);
                println!("  Messages:    {}", self.session.messages.len());
                println!("  Turns:       {}", stats.turns);
                println!("  Tool calls:  {}", stats.tool_calls);
                println!(
                    "  Tokens:      {} ({} prompt, {} completion)",
                    stats.usage.total_tokens,
                    stats.usage.prompt_tokens,
                    stats.usage.completion_tokens
                );
            }
            SlashCommand::Save(name) => {
                let cp = store.checkpoint(&self.session, name.as_deref()).await?;
                println!(
                    "  Saved checkpoint '{}' ({} messages) of session {}",
                    cp.name, cp.message_count, self.session.id
                );
            }
            SlashCommand::Checkpoint => {
                let cp = store.checkpoint(&self.session, None).await?;
                println!("  Created checkpoint '{}'", cp.name);
            }
            SlashCommand::Sessions => super::sessions::print(store.as_ref()).await?,
            SlashCommand::Resume(id) => {
                let session = store.resume(&SessionId::from(id.as_str())).await?;
                adopt_settings(&config, &session)?;
                self.session = session;
                println!(
                    "  Resumed {} ({} messages)",
                    self.session.id,
                    self.session.messages.len()
                );
            }
            SlashCommand::Restore(None) => {
                let checkpoints = store.checkpoints(&self.session.id).await?;
                if checkpoints.is_empty() {
                    println!("  No checkpoints yet (use /save or /checkpoint)");
                }
                for cp in checkpoints {
                    println!(
                        "  {:<20} {:>4} messages  {}",
                        cp.name,
                        cp.message_count,
                        cp.created_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            SlashCommand::Restore(Some(name)) => {
                self.session = store.restore(&self.session.id, &name).await?;
                println!(
                    "  Restored '{name}' ({} messages)",
                    self.session.messages.len()
                );
            }
            SlashCommand::Clear => {
                store.truncate(&mut self.session, 0).await?;
                println!("  Conversation cleared");
            }
            SlashCommand::Mcp => {
                if self.toolset.mcp_servers.is_empty() {
                    println!("  No MCP servers connected");
                }
                for server in &self.toolset.mcp_servers {
                    println!("  {} ({} tools)", server.client.server(), server.tools.len());
                    for tool in &server.tools {
                        println!("    {}", tool.name);
                    }
                }
            }
            SlashCommand::Exit => {}
        }
        Ok(())
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
