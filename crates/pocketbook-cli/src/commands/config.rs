//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use pocketbook_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, remote_url, remote_api_key, remote_db, pull_interval_secs, \
                    push_interval_secs, reload_cooldown_secs, reload_delay_ms, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "remote_url": config.remote_url,
                    "remote_api_key": config.remote_api_key.as_ref().map(|_| "(set)"),
                    "remote_db": config.remote_db,
                    "pull_interval_secs": config.pull_interval_secs,
                    "push_interval_secs": config.push_interval_secs,
                    "reload_cooldown_secs": config.reload_cooldown_secs,
                    "reload_delay_ms": config.reload_delay_ms,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  remote_url:           {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  remote_api_key:       {}",
                if config.remote_api_key.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  remote_db:            {}", display_path(&config.remote_db));
            println!("  pull_interval_secs:   {}", config.pull_interval_secs);
            println!("  push_interval_secs:   {}", config.push_interval_secs);
            println!("  reload_cooldown_secs: {}", config.reload_cooldown_secs);
            println!("  reload_delay_ms:      {}", config.reload_delay_ms);
            println!("  log_file:             {}", display_path(&config.log_file));
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "remote_url" => config.remote_url = optional(value),
        "remote_api_key" => config.remote_api_key = optional(value),
        "remote_db" => config.remote_db = optional(value).map(PathBuf::from),
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        "pull_interval_secs" => config.pull_interval_secs = number(key, value)?,
        "push_interval_secs" => config.push_interval_secs = number(key, value)?,
        "reload_cooldown_secs" => config.reload_cooldown_secs = number(key, value)?,
        "reload_delay_ms" => config.reload_delay_ms = number(key, value)?,
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid value for {}. Use a whole number.", key))
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_clears_optional_values() {
        let mut config = Config {
            remote_url: Some("https://db.example.com".to_string()),
            ..Config::default()
        };

        apply(&mut config, "remote_url", "none").unwrap();
        assert!(config.remote_url.is_none());

        apply(&mut config, "remote_db", "/share/pocketbook.db").unwrap();
        assert_eq!(config.remote_db, Some(PathBuf::from("/share/pocketbook.db")));
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "push_interval_secs", "soon").is_err());
        assert!(apply(&mut config, "sync_url", "ws://localhost").is_err());

        apply(&mut config, "push_interval_secs", "5").unwrap();
        assert_eq!(config.push_interval_secs, 5);
    }

    #[test]
    fn test_set_writes_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set(
            "data_dir".to_string(),
            temp_dir.path().join("data").display().to_string(),
            Some(&path),
            &output,
        )
        .unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("data_dir"));
    }
}
