//! Command implementations.

pub mod auth;
pub mod config;

pub use auth::{
    handle_accounts, handle_login, handle_logout, handle_logout_all, handle_status, handle_token,
    handle_whoami,
};
pub use config::{handle_completions, handle_config_path, handle_config_show};
