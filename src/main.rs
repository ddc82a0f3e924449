use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sqlgen_core::config::Config;
use sqlgen_core::graph::{GraphHandle, KnowledgeGraph};
use sqlgen_core::models::{ResolvedIntent, SchemaMetadata};
use sqlgen_core::services::{
    create_executor, mask_credentials, CacheManager, CacheService, ConnectionPoolManager,
    DatabaseType, LlmCorrector, QueryCompiler,
};
use sqlgen_core::validation::{CancelSignal, RefinerSettings, SqlRefiner};
use sqlgen_core::ErrorResponse;

const USAGE: &str = "usage: sqlgen <intent.json> [--schema <schema.json>]";

struct Args {
    intent_path: PathBuf,
    schema_path: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut intent_path = None;
    let mut schema_path = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--schema" => schema_path = Some(PathBuf::from(args.next().context(USAGE)?)),
            "-h" | "--help" => bail!(USAGE),
            _ if intent_path.is_none() => intent_path = Some(PathBuf::from(arg)),
            _ => bail!("unexpected argument '{}'\n{}", arg, USAGE),
        }
    }

    Ok(Args {
        intent_path: intent_path.context(USAGE)?,
        schema_path,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf, what: &str) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} {}", what, path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid {} {}", what, path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging; stdout carries the result, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(config.logging.style != "never")
        .with_writer(std::io::stderr)
        .init();

    let schema_path = args
        .schema_path
        .or_else(|| config.schema.path.as_ref().map(PathBuf::from))
        .context("No schema given: pass --schema or set SCHEMA_PATH")?;
    let schema: SchemaMetadata = read_json(&schema_path, "schema")?;

    let graph = KnowledgeGraph::from_schema(&schema).map_err(|e| {
        error!("Failed to build knowledge graph: {}", e);
        e
    })?;
    info!(
        "Knowledge graph ready: {} tables, {} relationships",
        graph.table_count(),
        graph.relationship_count()
    );
    let graph = Arc::new(GraphHandle::new(graph));

    let cache: Arc<dyn CacheService> = Arc::new(CacheManager::from_config(&config.cache).await);
    let mut compiler = QueryCompiler::new(graph, &config.database.dialect, cache, &config.planner)?;

    let pools = Arc::new(ConnectionPoolManager::with_config(config.database.pool_size));
    if let Some(url) = &config.database.url {
        let database_type = DatabaseType::parse(&config.database.dialect)?;
        let executor = create_executor(database_type, url, Arc::clone(&pools)).await?;
        if let Err(e) = executor.test_connection().await {
            warn!("Trial database {} not reachable yet: {}", mask_credentials(url), e);
        }

        let mut refiner = SqlRefiner::new(executor, RefinerSettings::from(&config.refinement))?;
        if config.llm.gateway_url.is_some() {
            let corrector = LlmCorrector::new(&config.llm)?.with_schema(&schema);
            refiner = refiner.with_corrector(Arc::new(corrector));
        } else {
            info!("No LLM gateway configured; failing statements will not be corrected");
        }
        compiler = compiler.with_refiner(refiner)?;
        info!("Validating against {}", mask_credentials(url));
    } else {
        info!("DATABASE_URL not set; SQL will be generated without trial execution");
    }

    let intent: ResolvedIntent = read_json(&args.intent_path, "intent")?;

    let (cancel_tx, cancel) = CancelSignal::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let outcome = compiler.handle(&intent, cancel).await;
    pools.close_all().await;

    match outcome {
        Ok(compiled) => {
            println!("{}", serde_json::to_string_pretty(&compiled)?);
            Ok(())
        }
        Err(detail) => {
            println!("{}", serde_json::to_string_pretty(&ErrorResponse { error: detail })?);
            std::process::exit(1);
        }
    }
}
