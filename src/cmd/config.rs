//! Configuration command: `kag-bridge config`.

use std::path::Path;

use anyhow::{Context, Result};
use kag_bridge::config::{BridgeConfig, CliOverrides, DEFAULT_CONFIG_FILE};

use crate::ConfigCommands;

pub fn cmd_config(
    config_path: Option<&Path>,
    overrides: &CliOverrides,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let file = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = BridgeConfig::resolve(config_path, overrides)?;
            if file.exists() {
                println!("# Config file: {}", file.display());
            } else {
                println!("# No config file found; using defaults");
            }
            println!("# Effective values (with env/CLI overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let config = BridgeConfig::resolve(config_path, overrides)?;
            // Surfaces unreadable key files as errors.
            config.server.resolved_api_keys()?;

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if file.exists() && !force {
                println!("{} already exists.", file.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            BridgeConfig::default().save(file)?;
            println!("Created {}", file.display());
        }
    }
    Ok(())
}
