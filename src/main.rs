//! OIDC Sandbox - single-identity OpenID Connect provider
//!
//! Local stand-in for a real identity provider: one synthetic account,
//! every login succeeds as it.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use oidc_sandbox::{
    cli::{Cli, Command},
    config::Config,
    http::Server,
    keys::KeyManager,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keygen { ref output, force }) => run_keygen(output, force),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Generate an RSA signing key at the requested path.
fn run_keygen(output: &Path, force: bool) -> ExitCode {
    if output.exists() && !force {
        eprintln!(
            "❌ {} already exists (use --force to overwrite)",
            output.display()
        );
        return ExitCode::FAILURE;
    }

    match KeyManager::generate(output) {
        Ok(()) => {
            println!("✅ Wrote RSA signing key to {}", output.display());
            match KeyManager::load(output) {
                Ok(keys) => println!("   kid: {}", keys.kid()),
                Err(e) => {
                    eprintln!("❌ Generated key failed to load back: {e}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Key generation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the provider server
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if let Some(ref issuer) = cli.issuer {
                config.issuer = issuer.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        issuer = %config.issuer_url(),
        clients = config.clients.len(),
        "Starting OIDC sandbox"
    );

    // Create and run server
    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}
