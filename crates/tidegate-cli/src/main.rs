//! Command-line interface for the tidegate LLM gateway.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use tidegate_api::{serve, AppState, MemoryHistory};
use tidegate_core::{ChatTurn, GatewayConfig};
use tidegate_llm::{Gateway, GenerationRequest, MemoryCache};

/// LLM gateway: routes chat traffic across inference backends.
#[derive(Parser, Debug)]
#[command(name = "tidegate")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a JSON config file. Falls back to TIDEGATE_ENDPOINTS.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway server.
    Serve {
        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind to.
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Run a single prompt and exit.
    Prompt {
        /// The prompt to send.
        prompt: String,
        /// Model override.
        #[arg(short, long)]
        model: Option<String>,
        /// Temperature.
        #[arg(short, long, default_value_t = 0.7)]
        temperature: f32,
    },
    /// List models across all healthy endpoints.
    ListModels,
    /// Probe every endpoint and print fleet health.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let default = if args.verbose {
            "tidegate=debug"
        } else {
            "tidegate=info"
        };
        tracing_subscriber::EnvFilter::new(default)
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Serve { host, port } => run_server(config, &host, port).await,
        Command::Prompt {
            prompt,
            model,
            temperature,
        } => run_prompt(config, &prompt, model, temperature).await,
        Command::ListModels => list_models(config).await,
        Command::Status => print_status(config).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<GatewayConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            GatewayConfig::from_json(&raw).context("parsing config file")
        }
        None => GatewayConfig::from_env()
            .context("no config file given and TIDEGATE_ENDPOINTS not usable"),
    }
}

async fn run_server(config: GatewayConfig, host: &str, port: u16) -> Result<()> {
    let gateway = Gateway::new(config)?.with_cache(Arc::new(MemoryCache::new()));
    let state = AppState::new(gateway, Arc::new(MemoryHistory::new()));
    let addr = format!("{host}:{port}");
    serve(state, &addr).await.context("server failed")
}

async fn run_prompt(
    config: GatewayConfig,
    prompt: &str,
    model: Option<String>,
    temperature: f32,
) -> Result<()> {
    let gateway = Gateway::new(config)?;
    let mut request =
        GenerationRequest::new(vec![ChatTurn::user(prompt)]).with_temperature(temperature);
    request.model = model;

    let mut stream = gateway.stream(&request).await?.fragments;
    while let Some(fragment) = stream.next().await {
        print!("{}", fragment?);
    }
    println!();
    Ok(())
}

async fn list_models(config: GatewayConfig) -> Result<()> {
    let default_model = config.default_model.clone();
    let gateway = Gateway::new(config)?;
    let mut models = gateway.list_models().await;
    models.sort();
    for model in &models {
        if *model == default_model {
            println!("{model} (default)");
        } else {
            println!("{model}");
        }
    }
    Ok(())
}

async fn print_status(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::new(config)?;
    let report = gateway.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
