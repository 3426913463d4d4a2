//! `termagent init` — write a starter configuration file.

use std::path::Path;

use termagent_config::AppConfig;

pub fn run(path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        println!("  Config already exists at {}", path.display());
        println!("  Use --force to overwrite it.");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    println!("  Wrote {}", path.display());
    println!("  Edit it to pick a provider, or set TERMAGENT_PROVIDER and the provider's API key.");
    Ok(())
}
