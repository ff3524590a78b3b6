use clap::Parser;
use serde_json::json;
use std::error::Error;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use toolscout::application::builtin::builtin_tools;
use toolscout::application::catalog::ToolCatalog;
use toolscout::application::discovery::{DiscoveryRouter, LexicalIndex, SemanticIndex};
use toolscout::application::dispatch::CapabilityDispatcher;
use toolscout::application::orchestrator::{Orchestrator, OrchestratorOptions, cancel_pair};
use toolscout::config::AppConfig;
use toolscout::model::{MessagesClient, OllamaEmbeddings};
use toolscout::provider::ProviderPool;
use toolscout::types::SearchStrategy;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "toolscout",
    version,
    about = "Tool discovery and deferred-loading engine for model-driven agents"
)]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    /// Override the default discovery strategy
    #[arg(long)]
    strategy: Option<String>,
    /// Override the configured turn limit
    #[arg(long)]
    max_turns: Option<usize>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    prompt_file: Option<String>,
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    info!("Starting toolscout");
    let cli = Cli::parse();
    debug!(config = ?cli.config, strategy = ?cli.strategy, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    } else {
        info!("Loaded configuration using default path or defaults");
    }

    let default_strategy = match &cli.strategy {
        Some(raw) => SearchStrategy::parse(raw)
            .ok_or_else(|| format!("unknown discovery strategy '{raw}'"))?,
        None => config.engine.default_strategy,
    };
    let prompt = load_prompt(&cli)?;

    // Assemble the catalog: built-in tools, configured tools, then whatever
    // the connected providers advertise.
    let builtins = builtin_tools();
    let mut descriptors: Vec<_> = builtins
        .iter()
        .map(|(descriptor, _)| descriptor.clone())
        .collect();
    descriptors.extend(config.tools.iter().cloned().map(|entry| entry.into_descriptor()));

    let request_timeout = Duration::from_secs(config.engine.dispatch_timeout_secs);
    let (pool, provider_tools) =
        ProviderPool::connect_all(config.providers.clone(), request_timeout).await;
    let pool = Arc::new(pool);
    descriptors.extend(provider_tools);

    let catalog = Arc::new(ToolCatalog::new(descriptors)?);
    info!(tools = catalog.len(), "Tool catalog assembled");

    let lexical = LexicalIndex::build(&catalog);
    let semantic = match &config.model.embedding_model {
        Some(model) => {
            let base_url = config
                .model
                .embedding_base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
            let embedder = Arc::new(OllamaEmbeddings::new(base_url, model.clone()));
            Some(SemanticIndex::build(&catalog, embedder, config.engine.similarity_floor).await)
        }
        None => {
            debug!("No embedding model configured; semantic discovery disabled");
            None
        }
    };
    let router = Arc::new(DiscoveryRouter::new(lexical, semantic));

    let mut dispatcher = CapabilityDispatcher::new(catalog.clone(), request_timeout)
        .with_remote(pool.clone());
    for (descriptor, executor) in builtins {
        dispatcher.register_local(descriptor.id, executor);
    }

    let api_key = config
        .model
        .api_key
        .clone()
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
    if api_key.is_none() {
        warn!("No API key configured; model requests may be rejected");
    }
    let provider = Arc::new(MessagesClient::with_timeout(
        config.model.base_url.clone(),
        api_key,
        Duration::from_secs(config.engine.exchange_timeout_secs),
    ));

    let options = OrchestratorOptions {
        model: config.model.name.clone(),
        system_prompt: cli.system.clone(),
        max_turns: cli.max_turns.unwrap_or(config.engine.max_turns),
        default_strategy,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(
        provider,
        router,
        Arc::new(dispatcher),
        catalog,
        options,
    );

    let (cancel_handle, cancel_token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling conversation");
            cancel_handle.cancel();
        }
    });

    let outcome = orchestrator.run(prompt, cancel_token).await;
    pool.shutdown().await;

    let output = json!({
        "conversation_id": outcome.conversation_id,
        "end": outcome.end,
        "tool_steps": outcome.steps,
        "usage": outcome.usage,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    info!("Engine execution finished");
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}

fn load_prompt(cli: &Cli) -> Result<String, Box<dyn Error>> {
    if let Some(path) = &cli.prompt_file {
        info!(path = %path, "Loading prompt from file");
        let content = fs::read_to_string(path)?;
        return Ok(normalize_prompt(content));
    }

    if !cli.prompt.is_empty() {
        return Ok(normalize_prompt(cli.prompt.join(" ")));
    }

    info!("Reading prompt from stdin");
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    let prompt = normalize_prompt(buffer);
    if prompt.is_empty() {
        return Err("prompt is empty".into());
    }
    Ok(prompt)
}

fn normalize_prompt(raw: String) -> String {
    raw.trim().to_string()
}
