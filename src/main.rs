use anyhow::{Context, Result};
use clap::Parser;
use nlq_engine::{EngineConfig, EngineError, ExtractedDocument, QueryEngine, Vocabulary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const HISTORY_LIMIT: usize = 20;

#[derive(Parser)]
#[command(name = "nlq")]
#[command(about = "Ask plain-English questions of a relational database and a document corpus")]
struct Args {
    /// Questions to answer. With none, questions are read from stdin, one per line.
    questions: Vec<String>,

    /// Database to query (postgres://..., sqlite:path). Defaults to DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// JSON Lines file of extracted documents ({"document_id", "text", "metadata"}).
    #[arg(long)]
    documents: Option<PathBuf>,

    /// JSON vocabulary replacing the built-in synonyms and cue words.
    #[arg(long)]
    vocabulary: Option<PathBuf>,

    /// Cache snapshot restored at start-up and written on exit.
    #[arg(long)]
    cache_snapshot: Option<PathBuf>,

    /// Print the resolved intent and SQL without executing anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env().context("loading configuration")?;
    if let Some(path) = &args.vocabulary {
        config.vocabulary = Vocabulary::from_path(path)
            .with_context(|| format!("loading vocabulary {}", path.display()))?;
    }
    let database_url = args.database_url.clone().or_else(|| config.database_url.clone());

    let engine = QueryEngine::new(config);

    if let Some(path) = &args.documents {
        let documents = read_documents(path)?;
        engine.index_documents(documents);
    }

    match &database_url {
        Some(url) => {
            let summary = engine.connect(url).await.context("connecting to database")?;
            print_json(&summary)?;
        }
        None => warn!("No database configured; only documents will be searched"),
    }

    if let Some(path) = args.cache_snapshot.as_ref().filter(|p| p.exists()) {
        match engine.load_cache_snapshot(path) {
            Ok(restored) => info!("Restored {} cached results from {}", restored, path.display()),
            Err(e) => warn!("Could not restore cache snapshot: {}", e),
        }
    }

    if args.questions.is_empty() {
        repl(&engine, args.dry_run).await?;
    } else {
        for question in &args.questions {
            answer(&engine, question, args.dry_run).await?;
        }
    }

    if let Some(path) = &args.cache_snapshot {
        match engine.save_cache_snapshot(path) {
            Ok(saved) => info!("Saved {} cached results to {}", saved, path.display()),
            Err(EngineError::NotConnected) => {}
            Err(e) => warn!("Could not save cache snapshot: {}", e),
        }
    }
    Ok(())
}

async fn repl(engine: &QueryEngine, dry_run: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":q" => break,
            ":refresh" => match engine.refresh_schema().await {
                Ok(summary) => print_json(&summary)?,
                Err(e) => error!("{}", e),
            },
            ":schema" => match engine.schema_summary() {
                Some(summary) => print_json(&summary)?,
                None => error!("{}", EngineError::NotConnected),
            },
            ":stats" => {
                let purged = engine.purge_expired_cache();
                if purged > 0 {
                    info!("🧹 Purged {} expired cache entries", purged);
                }
                print_json(&engine.cache_stats())?
            }
            ":history" => print_json(&engine.recent_queries(HISTORY_LIMIT))?,
            question => answer(engine, question, dry_run).await?,
        }
    }
    Ok(())
}

/// Answer one question. Query failures are reported and do not stop the
/// session.
async fn answer(engine: &QueryEngine, question: &str, dry_run: bool) -> Result<()> {
    let outcome = if dry_run {
        engine.translate(question).map(|t| serde_json::to_value(t))
    } else {
        engine.submit_query(question).await.map(|r| serde_json::to_value(r))
    };
    match outcome {
        Ok(value) => print_json(&value?),
        Err(e) if e.is_understanding_failure() => {
            error!("Could not understand query: {}", e);
            Ok(())
        }
        Err(e) => {
            error!("{}{}", e, if e.is_retryable() { " (retry may succeed)" } else { "" });
            Ok(())
        }
    }
}

fn read_documents(path: &Path) -> Result<Vec<ExtractedDocument>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading documents {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{} line {}: not a document record", path.display(), n + 1))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
