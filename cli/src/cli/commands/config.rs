//! Configuration and shell integration command handlers.

use crate::cli::args::ShellType;
use crate::config::{config_file, load_config, resolve_store_path};
use crate::error::Result;

/// Handles the `curator config path` command.
pub fn handle_config_path() -> Result<()> {
    println!("{}", config_file()?.display());
    Ok(())
}

/// Handles the `curator config show` command.
///
/// Prints the configuration after defaults and environment overrides.
pub fn handle_config_show() -> Result<()> {
    let config = load_config()?;
    print!("{}", toml::to_string_pretty(&config)?);
    println!();
    println!("# credential store: {}", resolve_store_path(&config)?.display());
    Ok(())
}

/// Handles the `curator completions <shell>` command.
pub fn handle_completions(shell: ShellType) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell};

    let mut cmd = crate::cli::Cli::command();
    let shell = match shell {
        ShellType::Bash => Shell::Bash,
        ShellType::Zsh => Shell::Zsh,
        ShellType::Fish => Shell::Fish,
    };

    generate(shell, &mut cmd, "curator", &mut std::io::stdout());

    Ok(())
}
