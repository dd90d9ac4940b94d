//! Migration tool for the Seeker database.
//!
//! Loads configuration, opens the database through `seeker-db`, and exposes
//! the `up`, `down`, `status`, and `create` subcommands.

pub mod commands;
pub mod config;

pub use commands::{render_status, run, Cli, Command, CommandError};
pub use config::{load_config, Config, ConfigError, LoggingConfig};
