//! Community Curator account connections.
//!
//! Signs in to an organizational (Microsoft) and a consumer (Google) account
//! through the browser, persists the tokens locally and refreshes them
//! silently so other tools can always ask for a usable access token.

mod auth;
mod cli;
mod client;
mod config;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::args::providers;
use crate::cli::{AuthCommands, Cli, Commands, ConfigCommands};
use crate::config::settings::env;
use crate::error::Result;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(env::LOG_LEVEL).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Run the command
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Auth { command } => match command {
            AuthCommands::Login {
                provider,
                no_browser,
                user,
            } => cli::commands::handle_login(provider.into(), no_browser, user).await,
            AuthCommands::Logout { all: true, .. } => cli::commands::handle_logout_all().await,
            AuthCommands::Logout { provider, user, .. } => {
                cli::commands::handle_logout(&providers(provider), user).await
            },
            AuthCommands::Token { provider, user } => {
                cli::commands::handle_token(provider.into(), user).await
            },
            AuthCommands::Status { json } => cli::commands::handle_status(json).await,
            AuthCommands::Accounts { provider } => {
                cli::commands::handle_accounts(&providers(provider)).await
            },
            AuthCommands::Whoami { provider, user } => {
                cli::commands::handle_whoami(provider.into(), user).await
            },
        },
        Commands::Config { command } => match command {
            ConfigCommands::Path => cli::commands::handle_config_path(),
            ConfigCommands::Show => cli::commands::handle_config_show(),
        },
        Commands::Completions { shell } => cli::commands::handle_completions(shell),
    }
}
