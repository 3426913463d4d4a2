//! `termagent sessions` — list saved sessions.

use termagent_config::AppConfig;
use termagent_core::SessionStore;
use termagent_session::FileSessionStore;

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileSessionStore::new(config.sessions_dir());
    print(&store).await
}

/// Print one line per session, most recent first.
pub async fn print(store: &dyn SessionStore) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = store.list().await?;
    if sessions.is_empty() {
        println!("  No saved sessions");
        return Ok(());
    }
    for s in sessions {
        println!(
            "  {}  {}  {:>3} turns  {:<24}  {}",
            s.id,
            s.updated_at.format("%Y-%m-%d %H:%M"),
            s.turns,
            s.model,
            s.preview.unwrap_or_default()
        );
    }
    println!();
    println!("  Resume with: termagent --resume <id>");
    Ok(())
}
