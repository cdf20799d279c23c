use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kag_bridge::config::{CliOverrides, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "kag-bridge")]
#[command(
    version,
    about = "OpenAI-compatible streaming bridge for knowledge-base reasoning pipelines"
)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the TOML config file (defaults to ./kag-bridge.toml when present)
    #[arg(long, global = true, env = "KAG_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Route prefix; chat routes are served under `{servlet}/openspg/v1`
    #[arg(long, global = true)]
    pub servlet: Option<String>,

    /// Project configuration service address
    #[arg(long, global = true)]
    pub openspg_service: Option<String>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            servlet: self.servlet.clone(),
            openspg_service: self.openspg_service.clone(),
            log_format: self.log_format,
            verbose: self.verbose,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// List projects known to the project configuration service
    Projects,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (file, environment and flags applied)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default kag-bridge.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so `env`-backed flags see it.
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Failed to load .env: {}", e);
    }

    let cli = Cli::parse();
    let overrides = cli.overrides();
    let config_path = cli.config.as_deref();

    match &cli.command {
        None | Some(Commands::Serve) => cmd::cmd_serve(config_path, &overrides).await?,
        Some(Commands::Projects) => cmd::cmd_projects(config_path, &overrides).await?,
        Some(Commands::Config { command }) => {
            cmd::cmd_config(config_path, &overrides, command.clone())?
        }
    }

    Ok(())
}
