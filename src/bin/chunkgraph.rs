//! chunkgraph CLI: run the extraction pipeline and query the graph.
//!
//! Usage:
//!   chunkgraph run [--collection name[:priority]]... [--budget n] [--config path] [--db path]
//!   chunkgraph query <name> [--depth n] [--relationship type] [--direction both]
//!   chunkgraph stats
//!   chunkgraph processed <collection>

use chunkgraph::{
    CollectionSpec, Direction, GraphQuery, GraphStore, JsonlSource, LlmExtractor, OllamaClient, OpenStore,
    Pipeline, PipelineConfig, Resolver, RunRequest, SqliteStore,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chunkgraph",
    version,
    about = "Incremental knowledge graph extraction from chunked text"
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to SQLite database file (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract unprocessed chunks and merge them into the graph
    Run {
        /// Collection to process, optionally with a priority (lower runs first)
        #[arg(long = "collection", value_parser = parse_collection)]
        collections: Vec<CollectionSpec>,
        /// Chunks allowed per UTC day (overrides config)
        #[arg(long)]
        budget: Option<u64>,
        /// Attempts per chunk (overrides config)
        #[arg(long)]
        max_retries: Option<u32>,
        /// Directory holding `<collection>.jsonl` files (overrides config)
        #[arg(long)]
        chunks_dir: Option<PathBuf>,
    },
    /// Print the subgraph around a named entity as JSON
    Query {
        /// Entity name
        name: String,
        /// Maximum hops from the entity
        #[arg(long, default_value_t = 2)]
        depth: usize,
        /// Only follow relationships of this type
        #[arg(long)]
        relationship: Option<String>,
        #[arg(long, value_enum, default_value_t = DirectionArg::Both)]
        direction: DirectionArg,
    },
    /// Show graph statistics
    Stats,
    /// List chunk ids already processed for a collection
    Processed {
        collection: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Outgoing,
    Incoming,
    Both,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Outgoing => Direction::Outgoing,
            DirectionArg::Incoming => Direction::Incoming,
            DirectionArg::Both => Direction::Both,
        }
    }
}

/// Parse `name` or `name:priority`
fn parse_collection(arg: &str) -> Result<CollectionSpec, String> {
    match arg.rsplit_once(':') {
        Some((name, priority)) if !name.is_empty() => {
            let priority = priority
                .parse::<u32>()
                .map_err(|_| format!("invalid priority '{}' for collection '{}'", priority, name))?;
            Ok(CollectionSpec::new(name, priority))
        }
        _ if !arg.is_empty() && !arg.contains(':') => Ok(CollectionSpec::new(arg, 100)),
        _ => Err(format!("invalid collection '{}'", arg)),
    }
}

fn load_config(path: Option<&PathBuf>, db: Option<PathBuf>) -> Result<PipelineConfig, String> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path).map_err(|e| e.to_string())?,
        None => {
            let mut config = PipelineConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(db) = db {
        config.pipeline.db_path = db;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &PipelineConfig) -> Result<SqliteStore, String> {
    SqliteStore::open(&config.pipeline.db_path).map_err(|e| format!("Failed to open database: {}", e))
}

fn with_store(config: &PipelineConfig, f: impl FnOnce(&dyn GraphStore) -> i32) -> i32 {
    match open_store(config) {
        Ok(store) => f(&store),
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_run(
    mut config: PipelineConfig,
    collections: Vec<CollectionSpec>,
    budget: Option<u64>,
    max_retries: Option<u32>,
    chunks_dir: Option<PathBuf>,
) -> i32 {
    if let Some(dir) = chunks_dir {
        config.pipeline.chunks_dir = dir;
    }
    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let client = OllamaClient::new(&config.llm.base_url, &config.llm.model).with_temperature(config.llm.temperature);
    let extractor = LlmExtractor::new(Arc::new(client), config.llm_timeout());
    let source = JsonlSource::new(&config.pipeline.chunks_dir);

    let mut request = RunRequest::new(budget.unwrap_or(config.pipeline.daily_budget));
    if !collections.is_empty() {
        request = request.collections(collections);
    }
    if let Some(max_retries) = max_retries {
        request = request.max_retries(max_retries);
    }

    let pipeline = match Pipeline::new(Arc::new(store), Arc::new(source), Arc::new(extractor), config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return 1;
        }
    };
    match runtime.block_on(pipeline.run(request)) {
        Ok(stats) => print_json(&stats),
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_query(
    store: &dyn GraphStore,
    config: &PipelineConfig,
    name: &str,
    depth: usize,
    relationship: Option<String>,
    direction: DirectionArg,
) -> i32 {
    let mut query = GraphQuery::seed(name).depth(depth).direction(direction.into());
    if let Some(relationship) = relationship {
        query = query.with_relationship(relationship);
    }
    let resolver = Resolver::new().with_synonyms(config.merge.synonyms.iter());
    match query.execute_with(store, &resolver) {
        Ok(outcome) => {
            if !outcome.is_found() {
                eprintln!("No entity named '{}'", name);
            }
            print_json(&outcome)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_stats(store: &dyn GraphStore) -> i32 {
    let stats = match store.stats() {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    println!("Entities:      {}", stats.entities);
    for (entity_type, count) in &stats.entities_by_type {
        println!("  {:<28} {:>7}", entity_type, count);
    }
    println!("Relationships: {}", stats.relationships);
    for (relationship_type, count) in &stats.relationships_by_type {
        println!("  {:<28} {:>7}", relationship_type, count);
    }
    if !stats.processed_chunks.is_empty() {
        println!("Processed chunks:");
        for (collection, count) in &stats.processed_chunks {
            println!("  {:<28} {:>7}", collection, count);
        }
    }
    0
}

fn cmd_processed(store: &dyn GraphStore, collection: &str) -> i32 {
    match store.processed_chunk_ids(collection) {
        Ok(ids) => {
            let mut ids: Vec<_> = ids.into_iter().collect();
            ids.sort();
            for id in ids {
                println!("{}", id);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref(), cli.db) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config.pipeline.log_level);

    let code = match cli.command {
        Commands::Run {
            collections,
            budget,
            max_retries,
            chunks_dir,
        } => cmd_run(config, collections, budget, max_retries, chunks_dir),
        Commands::Query {
            name,
            depth,
            relationship,
            direction,
        } => with_store(&config, |store| cmd_query(store, &config, &name, depth, relationship, direction)),
        Commands::Stats => with_store(&config, cmd_stats),
        Commands::Processed { collection } => with_store(&config, |store| cmd_processed(store, &collection)),
    };
    std::process::exit(code);
}
