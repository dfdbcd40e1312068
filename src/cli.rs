//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OIDC Sandbox - single-identity OpenID Connect provider for development
#[derive(Parser, Debug)]
#[command(name = "oidc-sandbox")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OIDC_SANDBOX_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OIDC_SANDBOX_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OIDC_SANDBOX_HOST")]
    pub host: Option<String>,

    /// Issuer URL advertised in discovery and embedded in tokens
    #[arg(long, env = "OIDC_SANDBOX_ISSUER")]
    pub issuer: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OIDC_SANDBOX_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OIDC_SANDBOX_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the provider server (default)
    Serve,

    /// Generate an RSA signing key in PEM format
    Keygen {
        /// Output path for the private key
        #[arg(short, long, default_value = "oidc-sandbox-key.pem")]
        output: PathBuf,

        /// Overwrite the output file if it exists
        #[arg(long)]
        force: bool,
    },
}
