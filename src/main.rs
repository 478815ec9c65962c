//! Healthcare assistant server and maintenance commands.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use clinical_assistant::agent::provision::{provision_agent, read_instructions};
use clinical_assistant::config::{AppConfig, Cli, Command};
use clinical_assistant::server::start_server;
use clinical_assistant::services::Services;
use clinical_assistant::telemetry;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before clap reads env-backed flags
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::from_cli(&cli).context("Configuration error")?);
    telemetry::init(config.telemetry.json);

    info!(
        name: "config.loaded",
        provider = ?config.secrets.provider,
        run_timeout_secs = config.agent.run_timeout_secs,
        "Configuration loaded"
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let (_services, invocation) = Services::for_chat(&config).await?;
            start_server(config, invocation).await?;
        }
        Command::Ask { question } => {
            let (_services, invocation) = Services::for_chat(&config).await?;
            let user_id = format!("ask-{}", uuid::Uuid::new_v4());
            let cancel = CancellationToken::new();
            let turn = invocation.run_turn(&user_id, &question, &cancel).await?;
            println!("{}", turn.reply);
        }
        Command::ProvisionAgent { name, instructions } => {
            let services = Services::for_maintenance(&config).await?;
            let instructions = read_instructions(&instructions).await?;
            let agent_id = provision_agent(
                services.agents.as_ref(),
                services.secret_store.as_ref(),
                &services.tools,
                &name,
                instructions,
            )
            .await?;
            println!("{agent_id}");
        }
        Command::MigrateDb => {
            let services = Services::for_maintenance(&config).await?;
            services
                .patients
                .migrate()
                .await
                .context("Failed to apply patient table migrations")?;
            info!("Patient table is up to date");
        }
    }

    Ok(())
}
