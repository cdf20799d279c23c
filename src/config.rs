//! Unified configuration for kag-bridge.
//!
//! Settings are layered: TOML file, then environment variables, then CLI
//! flags. Every section has serde defaults so an empty (or missing) file is
//! a valid configuration.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8888
//! servlet = "/api"
//! api_keys = []
//!
//! [openspg]
//! service_url = "http://127.0.0.1:8887"
//!
//! [stream]
//! poll_interval_ms = 100
//! model_name = "kag"
//!
//! [upstream]
//! max_retries = 3
//! retry_delay_ms = 1000
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "kag-bridge.toml";

/// Environment variable holding the project configuration service address.
pub const ENV_PROJECT_HOST: &str = "KAG_PROJECT_HOST_ADDR";

/// Environment variable holding the log filter directive.
pub const ENV_LOG: &str = "KAG_BRIDGE_LOG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub openspg: OpenSpgSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// HTTP listener and authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Route prefix; the OpenAI-compatible routes live under `{servlet}/openspg/v1`.
    #[serde(default = "default_servlet")]
    pub servlet: String,
    /// Accepted bearer keys. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Optional JSON object of `{name: key}` merged into `api_keys`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_keys_file: Option<PathBuf>,
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_servlet() -> String {
    "/api".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            servlet: default_servlet(),
            api_keys: Vec::new(),
            api_keys_file: None,
            cors_permissive: false,
        }
    }
}

impl ServerSection {
    /// Servlet prefix normalized to `/name` form, or empty for the root.
    pub fn servlet_prefix(&self) -> String {
        let trimmed = self.servlet.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }

    /// Inline keys plus the values of `api_keys_file`, deduplicated.
    pub fn resolved_api_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();

        if let Some(path) = &self.api_keys_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read API key file: {}", path.display()))?;
            let named: HashMap<String, String> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse API key file: {}", path.display()))?;
            let mut from_file: Vec<String> = named
                .into_values()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            from_file.sort();
            keys.extend(from_file);
        }

        let mut seen = std::collections::HashSet::new();
        keys.retain(|k| seen.insert(k.clone()));
        Ok(keys)
    }
}

/// Where project configuration is fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSpgSection {
    #[serde(default = "default_service_url")]
    pub service_url: String,
}

fn default_service_url() -> String {
    "http://127.0.0.1:8887".to_string()
}

impl Default for OpenSpgSection {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Value of the `model` field on every streamed chunk.
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_model_name() -> String {
    "kag".to_string()
}

fn default_keep_alive_secs() -> u64 {
    15
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            model_name: default_model_name(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl StreamSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }
}

/// Defaults for upstream LLM clients built by pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// Total attempts per generation, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_temperature() -> f32 {
    0.7
}

fn default_system_prompt() -> String {
    "you are a helpful assistant".to_string()
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `info` or `kag_bridge=debug,tower_http=info`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily rolling file in this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// Flag values that take precedence over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub servlet: Option<String>,
    pub openspg_service: Option<String>,
    pub log_format: Option<LogFormat>,
    pub verbose: bool,
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse kag-bridge config")
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize kag-bridge config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Load `path` if given (it must exist), otherwise `kag-bridge.toml` in
    /// the working directory when present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_PROJECT_HOST).filter(|v| !v.trim().is_empty()) {
            self.openspg.service_url = url.trim().to_string();
        }
        if let Some(level) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(servlet) = &cli.servlet {
            self.server.servlet = servlet.clone();
        }
        if let Some(url) = &cli.openspg_service {
            self.openspg.service_url = url.clone();
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Full layering: file → environment → CLI.
    pub fn resolve(path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env();
        config.apply_cli(cli);
        Ok(config)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.upstream.max_retries == 0 {
            warnings.push("upstream.max_retries is 0; one attempt will still be made".to_string());
        }
        if !(0.0..=2.0).contains(&self.upstream.temperature) {
            warnings.push(format!(
                "upstream.temperature {} is outside 0.0..=2.0",
                self.upstream.temperature
            ));
        }
        if !self.openspg.service_url.starts_with("http://")
            && !self.openspg.service_url.starts_with("https://")
        {
            warnings.push(format!(
                "openspg.service_url '{}' has no http(s) scheme",
                self.openspg.service_url
            ));
        }
        warnings
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
