//! Configuration management commands.
//!
//! Stores CLI configuration in `~/.vantage/config.toml`.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set the API server URL
    SetUrl {
        /// Server URL, e.g. http://localhost:8080
        url: String,
    },

    /// Show the current configuration
    Show,

    /// Reset configuration to defaults
    Reset,
}

/// Persistent CLI configuration stored on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub api_url: Option<String>,
}

/// Path to the configuration file (`~/.vantage/config.toml`).
fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".vantage").join("config.toml"))
}

fn load_config() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse config file")
}

fn save_config(cfg: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Load the stored API URL, if set.
pub fn load_api_url() -> Option<String> {
    load_config().ok().and_then(|cfg| cfg.api_url)
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::SetUrl { url } => {
            let mut cfg = load_config()?;
            cfg.api_url = Some(url.clone());
            save_config(&cfg)?;
            output::print_success(&format!("api_url = {}", url));
        }

        ConfigCommands::Show => {
            let cfg = load_config()?;
            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    output::print_detail(
                        "api_url",
                        cfg.api_url.as_deref().unwrap_or("(default) http://localhost:8080"),
                    );
                }
                _ => output::print_item(&cfg, format),
            }
        }

        ConfigCommands::Reset => {
            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}
