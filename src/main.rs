//! CI Token Broker - GitHub Actions OIDC to internal access token exchange.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use ci_token_broker::{
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
    token::Minter,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::ValidateToken { ref token }) => run_validate_token(&cli, token),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host.clone_from(host);
            }
            Some(config)
        }
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Load and validate configuration, then print what the broker would run with
fn run_check_config(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    println!("Configuration OK");
    println!("  Listen:          {}:{}", config.server.host, config.server.port);
    println!("  OIDC issuer:     {}", config.oidc.issuer);
    println!("  OIDC audience:   {}", config.oidc.audience);
    println!("  JWKS URI:        {}", config.oidc.resolved_jwks_uri());
    println!(
        "  Rate limit:      {} req/s, burst {}",
        config.rate_limit.requests_per_second, config.rate_limit.burst
    );
    println!(
        "  Policy:          default_branch_only={} ({}), allowlist={}, denylist={}",
        config.policy.default_branch_only,
        config.policy.default_branch,
        config.policy.allowlist.len(),
        config.policy.denylist.len()
    );
    println!(
        "  Access tokens:   iss={} aud={} ttl={}s scopes={}",
        config.token.issuer,
        config.token.audience,
        config.token.ttl.as_secs(),
        config.token.scopes.join(",")
    );
    ExitCode::SUCCESS
}

/// Validate an access token with the configured secret and print its claims
fn run_validate_token(cli: &Cli, token: &str) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let minter = match Minter::from_config(&config.token) {
        Ok(minter) => minter,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match minter.validate(token) {
        Ok(claims) => match serde_json::to_string_pretty(&claims) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize claims: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Token rejected: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the broker until shutdown
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to initialize broker");
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => {
            info!("Broker stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Broker exited with error");
            ExitCode::FAILURE
        }
    }
}
