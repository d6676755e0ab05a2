//! repopilot - agentic chat over a GitHub repository
//!
//! - `repopilot serve` runs the HTTP server
//! - `repopilot models` lists models available to the configured key

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use repopilot::chat::{ChatEngine, Credentials, HttpConnector};
use repopilot::config::{self, Config, DeployMode};
use repopilot::server;

#[derive(Parser)]
#[command(name = "repopilot")]
#[command(about = "Agentic chat engine for GitHub repositories", version)]
struct Args {
    /// Anthropic API key (requests may override with x-api-key)
    #[arg(long, env = "ANTHROPIC_API_KEY", global = true)]
    anthropic_api_key: Option<String>,

    /// GitHub token (requests may override with x-github-token)
    #[arg(long, env = "GITHUB_TOKEN", global = true)]
    github_token: Option<String>,

    /// Config file (default: ~/.repopilot/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        #[arg(long, env = "REPOPILOT_HOST")]
        host: Option<String>,

        #[arg(long, short = 'p', env = "REPOPILOT_PORT")]
        port: Option<u16>,

        /// Model used when a request does not name one
        #[arg(long, env = "REPOPILOT_MODEL")]
        model: Option<String>,

        /// direct: commit to the active branch; safe: working branch plus pull request
        #[arg(long, env = "REPOPILOT_DEPLOY_MODE")]
        deploy_mode: Option<DeployMode>,
    },
    /// List models available to the configured key
    Models,
}

fn load_env() {
    // ~/.repopilot/.env first, then the working directory
    let env_path = Some(config::config_dir().join(".env")).filter(|p| p.exists());
    if let Some(path) = env_path {
        let _ = dotenvy::from_path(&path);
    } else {
        let _ = dotenvy::dotenv();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("repopilot=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    // CLI args > env vars (handled by clap) > config file > defaults
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => Config::load(),
    };
    if args.anthropic_api_key.is_some() {
        config.anthropic_api_key = args.anthropic_api_key;
    }
    if args.github_token.is_some() {
        config.github_token = args.github_token;
    }

    match args.command {
        Command::Serve {
            host,
            port,
            model,
            deploy_mode,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(model) = model {
                config.default_model = model;
            }
            if let Some(mode) = deploy_mode {
                config.deploy_mode = mode;
            }
            let config = config.normalize();

            tracing::info!(
                model = %config.default_model,
                deploy_mode = ?config.deploy_mode,
                api_key = config.anthropic_api_key.is_some(),
                github_token = config.github_token.is_some(),
                "Starting repopilot"
            );

            let connector = Arc::new(HttpConnector::from_config(&config));
            server::run(ChatEngine::new(config, connector)).await
        }
        Command::Models => {
            let config = config.normalize();
            let connector = Arc::new(HttpConnector::from_config(&config));
            let engine = ChatEngine::new(config, connector);
            let models = engine.list_models(&Credentials::default()).await?;

            for model in models {
                let name = model.display_name.as_deref().unwrap_or("");
                match model.pricing {
                    Some(p) => println!(
                        "{:<32} {:<24} ${}/${} per MTok",
                        model.id, name, p.input_per_million, p.output_per_million
                    ),
                    None => println!("{:<32} {:<24} (no local pricing)", model.id, name),
                }
            }
            Ok(())
        }
    }
}
