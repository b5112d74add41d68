//! CLI module for curator.

pub mod args;
pub mod commands;

pub use args::{AuthCommands, Cli, Commands, ConfigCommands};
