mod auth;
mod cli;
mod config;
mod error;
mod model;
mod providers;
mod tools;
mod util;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use auth::device_code::OAuthDeviceCodeFlow;
use auth::host_session::AzureCliSession;
use auth::prompt::TerminalPrompter;
use auth::store::FileSecretStore;
use auth::CredentialManager;
use config::AppConfig;
use tools::Tools;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = cli::parse_args(&args)?;
    if command == cli::Command::Help {
        cli::print_help();
        return Ok(());
    }

    let config = config::load_config()?;

    // In serve mode stdin carries requests, so prompts must not read it.
    let interactive = command != cli::Command::Serve && std::io::stdin().is_terminal();
    let session = build_session(&config, interactive)?;

    cli::run(command, &session).await
}

// stdout is reserved for command and tool output.
fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn build_session(config: &AppConfig, interactive: bool) -> Result<cli::Session> {
    let user_agent = config
        .http
        .user_agent
        .clone()
        .unwrap_or_else(|| concat!("ado-work/", env!("CARGO_PKG_VERSION")).to_string());
    let http = reqwest::Client::builder()
        .user_agent(user_agent)
        .build()
        .context("Failed to build HTTP client")?;

    let credentials = Arc::new(CredentialManager::new(
        Arc::new(FileSecretStore::new(config::data_dir().join("secrets.json"))),
        Arc::new(AzureCliSession::new(config.auth.resource.clone())),
        Arc::new(OAuthDeviceCodeFlow::new(
            http.clone(),
            &config.auth.authority,
            &config.auth.client_id,
            &config.auth.resource,
        )),
        Arc::new(TerminalPrompter::new(interactive)),
    ));
    let tracker = providers::create_tracker(config, http, credentials.clone());
    let tools = Tools::new(tracker.clone(), credentials.clone());

    Ok(cli::Session {
        config_path: config::config_path(),
        credentials,
        tracker,
        tools,
    })
}
