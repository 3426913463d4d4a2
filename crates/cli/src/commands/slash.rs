//! REPL slash commands.

use termagent_core::ApprovalPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Config,
    /// Show or switch the provider
    Provider(Option<String>),
    /// Show or switch the chat model
    Model(Option<String>),
    /// Show or switch the model used for messages with an image
    Vision(Option<String>),
    /// Attach an image to the next message; shows the pending one when empty
    Image(Option<String>),
    Models,
    /// Show or switch the approval policy
    Approval(Option<ApprovalPolicy>),
    Tools,
    Stats,
    /// Named checkpoint; auto-named when empty
    Save(Option<String>),
    Sessions,
    Resume(String),
    Checkpoint,
    /// Roll back to a checkpoint; lists checkpoints when empty
    Restore(Option<String>),
    Clear,
    Mcp,
    Exit,
}

pub const HELP: &str = "\
  /help                 Show this help
  /config               Show the active configuration
  /provider [id]        Show or switch the LLM provider
  /model [name]         Show or switch the chat model
  /vision [model]       Show or switch the model used for images
  /image [path]         Attach an image to your next message
  /models               List models known for the provider
  /approval [policy]    Show or set approval: auto, on-request, never
  /tools                List available tools and their danger class
  /stats                Show session statistics
  /save [name]          Save a checkpoint of the session
  /sessions             List saved sessions
  /resume <id>          Switch to a saved session
  /checkpoint           Create an automatically named checkpoint
  /restore [name]       Roll back to a checkpoint (lists them without a name)
  /clear                Clear the conversation history
  /mcp                  Show connected MCP servers
  /exit                 Quit";

/// Parse a REPL line. `None` means the line is not a command.
pub fn parse(line: &str) -> Option<Result<SlashCommand, String>> {
    let line = line.trim();
    let rest = line.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts
        .next()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);

    let command = match name {
        "help" | "?" => Ok(SlashCommand::Help),
        "config" => Ok(SlashCommand::Config),
        "provider" => Ok(SlashCommand::Provider(arg)),
        "model" => Ok(SlashCommand::Model(arg)),
        "vision" => Ok(SlashCommand::Vision(arg)),
        "image" => Ok(SlashCommand::Image(arg)),
        "models" => Ok(SlashCommand::Models),
        "approval" => match arg {
            None => Ok(SlashCommand::Approval(None)),
            Some(a) => a.parse().map(|p| SlashCommand::Approval(Some(p))),
        },
        "tools" => Ok(SlashCommand::Tools),
        "stats" => Ok(SlashCommand::Stats),
        "save" => Ok(SlashCommand::Save(arg)),
        "sessions" => Ok(SlashCommand::Sessions),
        "resume" => arg
            .map(SlashCommand::Resume)
            .ok_or_else(|| "usage: /resume <session-id>".to_string()),
        "checkpoint" => Ok(SlashCommand::Checkpoint),
        "restore" => Ok(SlashCommand::Restore(arg)),
        "clear" => Ok(SlashCommand::Clear),
        "mcp" => Ok(SlashCommand::Mcp),
        "exit" | "quit" | "q" => Ok(SlashCommand::Exit),
        other => Err(format!("unknown command '/{other}' (try /help)")),
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(parse("hello there").is_none());
        assert!(parse("  what does /tmp hold?").is_none());
    }

    #[test]
    fn commands_with_and_without_arguments() {
        assert_eq!(parse("/model").unwrap(), Ok(SlashCommand::Model(None)));
        assert_eq!(
            parse("/model  llama3.1:8b ").unwrap(),
            Ok(SlashCommand::Model(Some("llama3.1:8b".into())))
        );
        assert_eq!(
            parse("/approval never").unwrap(),
            Ok(SlashCommand::Approval(Some(ApprovalPolicy::Never)))
        );
        assert_eq!(parse("/save").unwrap(), Ok(SlashCommand::Save(None)));
        assert_eq!(
            parse("/vision llava:13b").unwrap(),
            Ok(SlashCommand::Vision(Some("llava:13b".into())))
        );
        assert_eq!(
            parse("/image shots/error dialog.png").unwrap(),
            Ok(SlashCommand::Image(Some("shots/error dialog.png".into())))
        );
        assert_eq!(parse("/quit").unwrap(), Ok(SlashCommand::Exit));
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(parse("/approval sometimes").unwrap().is_err());
        assert!(parse("/resume").unwrap().is_err());
        let err = parse("/frobnicate").unwrap().unwrap_err();
        assert!(err.contains("/frobnicate"));
    }
}
