use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use skema::cancel::CancelToken;
use skema::chunk::ObjectType;
use skema::cli::{Cli, Commands, ConfigAction};
use skema::config::Config;
use skema::embed::{EmbeddingService, OllamaEmbedder};
use skema::error::{Result, SkemaError};
use skema::llm::{GenerationService, OllamaGenerator};
use skema::orchestrator::{ChatRequest, Orchestrator, TurnEvent};
use skema::schema::{JsonFileCrawler, ProgressEvent};
use skema::store::{SearchOptions, VectorStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Index { source, file } => {
            cmd_index(cli.config, &source, file).await?;
        }
        Commands::Ask { source, question } => {
            cmd_ask(cli.config, &source, &question).await?;
        }
        Commands::Search {
            source,
            query,
            limit,
            object_type,
            json,
        } => {
            cmd_search(cli.config, &source, &query, limit, object_type, json).await?;
        }
        Commands::Stats { source, json } => {
            cmd_stats(cli.config, source, json).await?;
        }
        Commands::Clear { source } => {
            cmd_clear(cli.config, &source).await?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = if verbose { "skema=debug" } else { "skema=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt().with_env_filter(filter).with_target(false).init();
}

struct Services {
    orchestrator: Orchestrator,
    generator: Arc<OllamaGenerator>,
    embedder: Arc<OllamaEmbedder>,
}

fn build_services(config: &Config) -> Result<Services> {
    let generator = Arc::new(OllamaGenerator::new(
        &config.llm.base_url,
        &config.llm.model,
        config.llm.temperature,
        config.llm.fallback_context_length,
    ));
    let embedder = Arc::new(OllamaEmbedder::new(
        &config.embedding.base_url,
        &config.embedding.model,
        config.embedding.dimension,
    ));

    let data_dir = expand_path(&config.storage.data_dir)?;
    let store = Arc::new(VectorStore::new(config.store_config(data_dir)?)?);

    let orchestrator = Orchestrator::new(
        store,
        generator.clone() as Arc<dyn GenerationService>,
        embedder.clone() as Arc<dyn EmbeddingService>,
        config.enrichment_config(),
        config.context_config(),
        config.orchestrator_config(),
    );

    Ok(Services {
        orchestrator,
        generator,
        embedder,
    })
}

async fn ensure_model_service(generator: &OllamaGenerator) -> Result<()> {
    if !generator.is_available().await {
        return Err(SkemaError::Unreachable {
            service: "ollama".to_string(),
            detail: generator.base_url().to_string(),
        });
    }
    if !generator.has_model().await? {
        println!(
            "⚠ Model '{}' is not present on the service. Pull it first (e.g. `ollama pull {}`).",
            generator.model(),
            generator.model()
        );
    }
    Ok(())
}

async fn cmd_index(config_path: Option<PathBuf>, source: &str, file: PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    let services = build_services(&config)?;
    ensure_model_service(&services.generator).await?;

    let crawler = JsonFileCrawler::new(file);
    let cancel = CancelToken::new();

    // Ctrl-C requests cooperative cancellation instead of killing the process
    let ctrlc_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling crawl...");
            ctrlc_token.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(64);
    let drain = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            match &event.current_object {
                Some(name) => println!(
                    "  [{}] {}/{} {}",
                    event.phase, event.current, event.total, name
                ),
                None => println!("  [{}] {}/{}", event.phase, event.current, event.total),
            }
        }
    });

    let result = services
        .orchestrator
        .index_source(source, &crawler, &progress_tx, cancel)
        .await;
    drop(progress_tx);
    let _ = drain.await;

    match result {
        Ok(()) => {
            let stats = services.orchestrator.store().stats(source).await?;
            println!("✓ Indexed {} chunks for source '{}'", stats.total_chunks, source);
            println!(
                "  {} tables, {} views, {} procedures, {} functions",
                stats.table_chunks, stats.view_chunks, stats.procedure_chunks, stats.function_chunks
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            println!("✗ Crawl cancelled; previous index (if any) left untouched");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn cmd_ask(config_path: Option<PathBuf>, source: &str, question: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let services = build_services(&config)?;
    ensure_model_service(&services.generator).await?;

    let request = ChatRequest {
        source_id: source.to_string(),
        message: question.to_string(),
        history: Vec::new(),
        carried_summary: None,
    };

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let turn = services.orchestrator.chat_turn(request, events_tx);
    let drain = async {
        while let Some(event) = events_rx.recv().await {
            match event {
                TurnEvent::Thinking {
                    step,
                    detail,
                    elapsed_ms,
                } => {
                    eprintln!("· {:?}: {} ({} ms)", step, detail, elapsed_ms);
                }
                TurnEvent::Token(token) => {
                    print!("{}", token);
                    let _ = std::io::stdout().flush();
                }
                TurnEvent::Done { retrieval, .. } => {
                    println!();
                    eprintln!(
                        "· answered from {} chunks ({} ms search, ~{} prompt tokens)",
                        retrieval.chunks.len(),
                        retrieval.search_ms,
                        retrieval.estimated_tokens
                    );
                }
                TurnEvent::Error(e) => match e {
                    SkemaError::BudgetExceeded { .. } => {
                        eprintln!("✗ {}. Start a new conversation.", e);
                    }
                    other => eprintln!("✗ {}", other),
                },
            }
        }
    };
    tokio::join!(turn, drain);

    Ok(())
}

async fn cmd_search(
    config_path: Option<PathBuf>,
    source: &str,
    query: &str,
    limit: usize,
    object_type: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let services = build_services(&config)?;

    let query_vector = services.embedder.embed(query).await?;

    let mut options = SearchOptions::new(limit).with_query_text(query);
    if let Some(ty) = object_type.as_deref().and_then(ObjectType::parse) {
        options = options.with_type_filter(ty);
    }

    let results = services
        .orchestrator
        .store()
        .search(source, &query_vector, &options)
        .await?;

    if json {
        let rendered = serde_json::to_string_pretty(&results).map_err(|e| SkemaError::Json {
            source: e,
            context: "Failed to serialize search results".to_string(),
        })?;
        println!("{}", rendered);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results. Has this source been indexed?");
        return Ok(());
    }

    for (rank, scored) in results.iter().enumerate() {
        println!(
            "{:>2}. [{:.4}] [{}] {}",
            rank + 1,
            scored.score,
            scored.chunk.object_type,
            scored.chunk.qualified_name()
        );
        let summary = if scored.chunk.summary.is_empty() {
            scored.chunk.content.lines().next().unwrap_or_default()
        } else {
            &scored.chunk.summary
        };
        println!("    {}", summary);
    }

    Ok(())
}

async fn cmd_stats(config_path: Option<PathBuf>, source: Option<String>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let services = build_services(&config)?;
    let store = services.orchestrator.store();

    match source {
        Some(source) => {
            // Stats are the one surface where a missing source is an error,
            // not an empty result
            if !store.list_sources()?.contains(&source) {
                return Err(SkemaError::NotFound { source_id: source });
            }
            let stats = store.stats(&source).await?;
            if json {
                let rendered =
                    serde_json::to_string_pretty(&stats).map_err(|e| SkemaError::Json {
                        source: e,
                        context: "Failed to serialize stats".to_string(),
                    })?;
                println!("{}", rendered);
                return Ok(());
            }

            println!("Index stats for '{}'", source);
            println!("  Total chunks:    {}", stats.total_chunks);
            println!("  Tables:          {}", stats.table_chunks);
            println!("  Views:           {}", stats.view_chunks);
            println!("  Procedures:      {}", stats.procedure_chunks);
            println!("  Functions:       {}", stats.function_chunks);
            println!("  With summary:    {}", stats.chunks_with_summary);
            println!("  With embedding:  {}", stats.chunks_with_embedding);
            match stats.last_indexed_at {
                Some(ts) => println!("  Last indexed:    {}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("  Last indexed:    never"),
            }
        }
        None => {
            let sources = store.list_sources()?;
            if sources.is_empty() {
                println!("No indexed sources. Run `skema index <source> --file <schema.json>`.");
                return Ok(());
            }
            println!("Indexed sources: {}", sources.len());
            for source in sources {
                let stats = store.stats(&source).await?;
                println!("  {} ({} chunks)", source, stats.total_chunks);
            }
        }
    }

    Ok(())
}

async fn cmd_clear(config_path: Option<PathBuf>, source: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let services = build_services(&config)?;

    services.orchestrator.store().clear(source).await?;
    println!("✓ Cleared index for source '{}'", source);
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path)?;
            let json = serde_json::to_string_pretty(&config).map_err(|e| SkemaError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;
            println!("{}", json);
        }
        ConfigAction::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = Config::default_path()?;

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SkemaError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            let config = Config::default();
            config.save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'skema config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        return Ok(config);
    }

    Config::load(&path)
}

fn expand_path(path: &std::path::Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| SkemaError::Config("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| SkemaError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
