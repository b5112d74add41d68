//! Command-line argument parsing.

use clap::{Parser, Subcommand, ValueEnum};

use crate::auth::Provider;

/// Community Curator account connections.
///
/// Signs in to the organizational (Microsoft) and consumer (Google) accounts
/// the curator works with, and keeps their tokens fresh.
#[derive(Parser, Debug)]
#[command(name = "curator")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage account connections.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completion scripts.
    ///
    /// Outputs completion script for the specified shell.
    /// Follow shell-specific instructions to install.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: ShellType,
    },
}

/// Supported shell types for completions.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ShellType {
    Bash,
    Zsh,
    Fish,
}

/// Authentication subcommands.
#[derive(Subcommand, Debug)]
pub enum AuthCommands {
    /// Sign in through the browser and wait for the result.
    Login {
        /// Account type to connect.
        #[arg(value_enum)]
        provider: ProviderArg,

        /// Print the sign-in URL instead of opening the browser.
        #[arg(long)]
        no_browser: bool,

        /// Store consumer tokens for this application user.
        #[arg(long, env = "CURATOR_USER")]
        user: Option<String>,
    },

    /// Forget stored tokens for one provider, or both.
    Logout {
        /// Account type to disconnect (all when omitted).
        #[arg(value_enum)]
        provider: Option<ProviderArg>,

        /// Consumer credentials of this application user.
        #[arg(long, env = "CURATOR_USER")]
        user: Option<String>,

        /// Sign out everywhere and wipe the store, for every application user.
        #[arg(long, conflicts_with = "provider")]
        all: bool,
    },

    /// Print a valid access token, refreshing it if needed.
    Token {
        /// Account type to get a token for.
        #[arg(value_enum)]
        provider: ProviderArg,

        /// Consumer credentials of this application user.
        #[arg(long, env = "CURATOR_USER")]
        user: Option<String>,
    },

    /// Show what is stored locally, without contacting the providers.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List cached accounts.
    Accounts {
        /// Account type to list (all when omitted).
        #[arg(value_enum)]
        provider: Option<ProviderArg>,
    },

    /// Ask the provider who the stored token belongs to.
    Whoami {
        /// Account type to query.
        #[arg(value_enum)]
        provider: ProviderArg,

        /// Consumer credentials of this application user.
        #[arg(long, env = "CURATOR_USER")]
        user: Option<String>,
    },
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the configuration file location.
    Path,

    /// Print the effective configuration as TOML.
    Show,
}

/// Provider argument for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderArg {
    /// Organizational account (Microsoft).
    #[value(alias = "microsoft")]
    Org,
    /// Consumer account (Google).
    #[value(alias = "google")]
    Consumer,
}

impl From<ProviderArg> for Provider {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Org => Self::Org,
            ProviderArg::Consumer => Self::Consumer,
        }
    }
}

/// Expands an optional provider argument to the providers it covers.
#[must_use]
pub fn providers(arg: Option<ProviderArg>) -> Vec<Provider> {
    arg.map_or_else(|| Provider::ALL.to_vec(), |p| vec![p.into()])
}
