use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use mcp_vector_search::config;
use mcp_vector_search::server::run_stdio_server;
use mcp_vector_search::system::System;
use mcp_vector_search::watch;

#[derive(Debug, Parser)]
#[command(name = "mcp-vector-search")]
#[command(version)]
#[command(about = "Semantic search over configured sources, served as an MCP stdio tool")]
struct Cli {
    /// Project directory searched for .mcp-vector-search/config.toml
    /// (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    project: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the MCP stdio server (the default when no subcommand is given)
    Mcp,
    /// Ingest the configured sources once and run a single query
    Search {
        /// Query text
        query: String,

        /// Maximum number of results
        #[arg(long, short = 'n', default_value_t = 10)]
        limit: usize,

        /// Metadata equality filter, repeatable: --filter key=value
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the JSON-RPC transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project = match cli.project {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current dir")?,
    };
    let cfg = config::load(&project)?;

    match cli.cmd {
        None | Some(Command::Mcp) => serve(cfg),
        Some(Command::Search {
            query,
            limit,
            filters,
        }) => one_shot_search(cfg, &query, limit, &filters),
    }
}

fn serve(cfg: config::Config) -> Result<()> {
    let system = Arc::new(System::from_config(cfg)?);
    system.ingest_all();

    let watcher = watch::start(Arc::clone(&system));

    let result = run_stdio_server(Arc::clone(&system));

    // Shutdown order: stop the watcher first, then release everything else.
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    result
}

fn one_shot_search(cfg: config::Config, query: &str, limit: usize, filters: &[String]) -> Result<()> {
    let mut metadata = BTreeMap::new();
    for filter in filters {
        let Some((key, value)) = filter.split_once('=') else {
            bail!("--filter takes key=value, got `{filter}`");
        };
        metadata.insert(key.to_string(), value.to_string());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .expect("static template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message("loading embedding model...");
    let system = System::from_config(cfg)?;

    spinner.set_message("indexing sources...");
    let (files, segments) = system.ingest_all();
    spinner.finish_with_message(format!("indexed {files} files ({segments} segments)"));

    let hits = system
        .search(query, limit, &metadata)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let payload: Vec<serde_json::Value> = hits
        .iter()
        .map(|hit| serde_json::json!({ "content": hit.text, "score": hit.score }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
