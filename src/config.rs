use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::agent::InvocationSettings;
use crate::agent::provision::DEFAULT_AGENT_NAME;

/// Prefix of configuration environment variables, e.g. `CLINICAL_SERVER__PORT`.
pub const ENV_PREFIX: &str = "CLINICAL";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE", global = true)]
    pub config: Option<String>,

    /// Address to bind
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT", global = true)]
    pub port: Option<u16>,

    /// Key Vault name; expands to `https://<name>.vault.azure.net`
    #[arg(long, env = "KEY_VAULT_NAME", global = true)]
    pub key_vault_name: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: Option<bool>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the chat server (default)
    Serve,
    /// Ask one question on a fresh thread and print the reply
    Ask {
        /// The question to send
        question: String,
    },
    /// Create the hosted agent and store its id as the `agent-id` secret
    ProvisionAgent {
        /// Agent name
        #[arg(long, default_value = DEFAULT_AGENT_NAME)]
        name: String,
        /// File holding the agent instructions
        #[arg(long, default_value = "instructions.txt")]
        instructions: PathBuf,
    },
    /// Create the patient table and indexes if missing
    MigrateDb,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Cli(#[from] clap::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub secrets: SecretsConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecretsProvider {
    KeyVault,
    Env,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    pub provider: SecretsProvider,
    /// Required for the Key Vault provider.
    pub vault_url: Option<String>,
    /// User-assigned managed identity; system-assigned when unset.
    pub managed_identity_client_id: Option<String>,
    /// Prefix for the env provider's variable names.
    pub env_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub run_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_tool_rounds: usize,
    pub api_version: String,
    /// Users whose thread mapping is kept before idle ones are dropped.
    pub max_tracked_users: usize,
}

impl AgentConfig {
    pub fn invocation_settings(&self) -> InvocationSettings {
        InvocationSettings {
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_tool_rounds: self.max_tool_rounds,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    pub guideline_top_k: usize,
    pub discharge_dir: PathBuf,
    pub serpapi_base_url: String,
    pub search_api_version: String,
    pub embedding_api_version: String,
    pub patient_row_limit: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub json: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;
        Self::from_cli(&cli)
    }

    /// Priority: CLI flag > CLI env var > `CLINICAL_*` env > config file > defaults.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("secrets.provider", "keyvault")?
            .set_default("secrets.env_prefix", "")?
            .set_default("agent.run_timeout_secs", 300)?
            .set_default("agent.poll_interval_ms", 500)?
            .set_default("agent.max_tool_rounds", 10)?
            .set_default("agent.api_version", crate::agent::client::DEFAULT_API_VERSION)?
            .set_default(
                "agent.max_tracked_users",
                i64::try_from(crate::session::DEFAULT_MAX_USERS).unwrap_or(i64::MAX),
            )?
            .set_default("tools.guideline_top_k", 10)?
            .set_default("tools.discharge_dir", crate::tools::discharge::DEFAULT_OUTPUT_DIR)?
            .set_default("tools.serpapi_base_url", crate::tools::web_search::SERPAPI_BASE_URL)?
            .set_default("tools.search_api_version", "2024-07-01")?
            .set_default("tools.embedding_api_version", "2024-04-01-preview")?
            .set_default("tools.patient_row_limit", 50)?
            .set_default("telemetry.json", false)?;

        // Explicit file must exist; ./config.{yaml,toml,json} is picked up if present.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(host) = &cli.host {
            builder = builder.set_override("server.host", host.as_str())?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(name) = &cli.key_vault_name {
            builder = builder
                .set_override("secrets.vault_url", format!("https://{name}.vault.azure.net"))?;
        }
        if let Some(json) = cli.log_json {
            builder = builder.set_override("telemetry.json", json)?;
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "agent.poll_interval_ms must be positive".into(),
            ));
        }
        if self.agent.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.run_timeout_secs must be positive".into(),
            ));
        }
        if self.agent.max_tracked_users == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_tracked_users must be positive".into(),
            ));
        }
        if self.tools.guideline_top_k == 0 {
            return Err(ConfigError::Invalid(
                "tools.guideline_top_k must be positive".into(),
            ));
        }
        if self.tools.patient_row_limit <= 0 {
            return Err(ConfigError::Invalid(
                "tools.patient_row_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}
