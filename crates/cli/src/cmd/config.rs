//! Configuration management command
//!
//! Provides CLI interface to view and edit `<root>/config.toml`.

use anyhow::{Context, Result};
use keepsake_cli::Config;
use keepsake_core::Layout;
use owo_colors::OwoColorize;
use std::path::Path;

/// List all configuration values
pub async fn run_list(root: &Path) -> Result<()> {
    let layout = Layout::new(root);
    let config = Config::load(&layout.config_file())?;

    println!("{}", "Configuration".bold());
    println!(
        "{}: {}\n",
        "Location".dimmed(),
        layout.config_file().display().dimmed()
    );

    let mut current_section = String::new();
    for (key, value) in config.entries()? {
        let (section, field) = key.split_once('.').unwrap_or(("", key.as_str()));
        if section != current_section {
            if !current_section.is_empty() {
                println!();
            }
            println!("{}", format!("[{}]", section).yellow());
            current_section = section.to_string();
        }
        println!("  {} = {}", field.cyan(), value);
    }
    Ok(())
}

/// Get a single configuration value
pub async fn run_get(root: &Path, key: &str) -> Result<()> {
    let layout = Layout::new(root);
    let config = Config::load(&layout.config_file())?;
    println!("{}", config.get(key)?);
    Ok(())
}

/// Set a configuration value
pub async fn run_set(root: &Path, key: &str, value: &str) -> Result<()> {
    let layout = Layout::new(root);
    layout.init()?;
    let mut config = Config::load(&layout.config_file())?;

    config
        .set(key, value)
        .context("Invalid configuration value")?;
    config.save(&layout)?;

    println!("{} {} = {}", "✓".green(), key.cyan(), value);
    println!(
        "{}",
        "Note: Restart daemon for changes to take effect (keepsake stop && keepsake start)".yellow()
    );
    Ok(())
}

/// Show the config file path
pub async fn run_path(root: &Path) -> Result<()> {
    let path = Layout::new(root).config_file();
    println!("{}", path.display());
    if !path.exists() {
        println!("{}", "File does not exist; defaults are in effect.".yellow());
    }
    Ok(())
}
