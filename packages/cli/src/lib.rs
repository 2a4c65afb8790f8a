// ABOUTME: Command line front end for the Nodefleet supervisor
// ABOUTME: Argument parsing, rendering, saved configuration and the interactive session

pub mod commands;
pub mod config;
pub mod display;
pub mod session;

pub use commands::{handle_config, App, Cli, Commands, Mode};
pub use config::{CliConfig, ConfigError};
pub use session::{parse_line, run_session, SessionCommand};
