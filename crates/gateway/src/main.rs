use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tb_gateway::api;
use tb_gateway::cli::{self, Cli, Command, ConfigCommand};
use tb_gateway::state::AppState;
use tb_providers::ProviderRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _path) = cli::load_config(cli.config.as_ref())?;
            run_server(config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            if !cli::validate(cli.config.as_ref()) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _path) = cli::load_config(cli.config.as_ref())?;
            cli::show(&config);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TOOLBRIDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config: tb_domain::config::Config) -> anyhow::Result<()> {
    let providers = ProviderRegistry::from_env();
    if providers.is_empty() {
        tracing::warn!("no LLM providers configured — agent streams will fail until one is");
    } else {
        tracing::info!(providers = ?providers.ids(), "LLM providers ready");
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::build(config, providers).context("building application state")?;

    let app = api::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "toolbridge listening");

    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
