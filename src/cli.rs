//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CI token broker - exchange CI OIDC identity tokens for short-lived access tokens
#[derive(Parser, Debug)]
#[command(name = "ci-token-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CI_BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CI_BROKER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CI_BROKER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CI_BROKER_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CI_BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker (default)
    Serve,

    /// Load and validate the configuration, then print a summary
    CheckConfig,

    /// Validate an access token minted by this broker and print its claims
    ValidateToken {
        /// The access token (JWT)
        #[arg(required = true)]
        token: String,
    },
}
