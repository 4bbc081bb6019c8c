//! mnemos CLI: operate a knowledge graph store from the shell.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use mnemos::api::{Api, Credentials, Request, Response};
use mnemos::concept::{ConceptId, Metadata, NewAssociation, NewConcept, RelationType};
use mnemos::config::EngineConfig;
use mnemos::embed::{HttpEmbeddingConfig, HttpEmbeddingProvider};
use mnemos::engine::{Engine, HealthStatus};
use mnemos::paths::DataPaths;
use mnemos::reconcile::Reconciler;
use mnemos::vector::IndexSource;

#[derive(Parser)]
#[command(name = "mnemos", version, about = "Durable knowledge graph store with vector search")]
struct Cli {
    /// Data directory (overrides the config file and MNEMOS_STORAGE_PATH).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file. Defaults to `<data-dir>/mnemos.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Embedding dimension (only meaningful for `init`).
    #[arg(long, global = true)]
    dimension: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a data directory and write its configuration.
    Init,

    /// Learn a concept.
    Learn {
        content: String,
        /// Comma-separated embedding, e.g. "0.1,0.2,0.3".
        #[arg(long, conflicts_with = "embed")]
        embedding: Option<String>,
        /// Fetch the embedding from the configured embedding service.
        #[arg(long, conflicts_with_all = ["id", "confidence", "metadata"])]
        embed: bool,
        /// Explicit id (default: derived from the content).
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        confidence: Option<f32>,
        /// Metadata entries as key=value, repeatable.
        #[arg(long = "meta")]
        metadata: Vec<String>,
    },

    /// Learn an association between two concepts.
    Associate {
        source: String,
        target: String,
        #[arg(long, default_value = "semantic")]
        relation: RelationType,
        #[arg(long, default_value = "1.0")]
        confidence: f32,
    },

    /// Adjust a concept's strength.
    Strength {
        concept_id: String,
        #[arg(allow_negative_numbers = true)]
        delta: f32,
    },

    /// Delete a concept and its associations.
    Delete { concept_id: String },

    /// Show one concept with its associations.
    Get { concept_id: String },

    /// Nearest concepts to an embedding.
    Search {
        /// Comma-separated query embedding.
        embedding: String,
        #[arg(long, default_value = "10")]
        k: usize,
        /// Brute-force search instead of the HNSW graph.
        #[arg(long)]
        exact: bool,
    },

    /// Find concepts whose content contains every word of the query.
    Text { query: String },

    /// Show engine statistics as JSON.
    Stats,

    /// Show engine health.
    Health,

    /// Snapshot the graph and index and truncate the WAL.
    Flush,

    /// Inspect the write-ahead log.
    Wal {
        #[command(subcommand)]
        action: WalAction,
    },

    /// Serve JSON-lines requests on stdin, responses on stdout.
    Run,
}

#[derive(Subcommand)]
enum WalAction {
    /// List the entries currently in the log.
    Inspect {
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Init => {
            let paths = DataPaths::new(&config.storage_path);
            paths.ensure_dirs()?;
            if !paths.config.exists() {
                config.save(&paths.config)?;
            }
            let engine = Engine::open(config)?;
            println!("Initialized mnemos at {}", paths.root.display());
            println!("  dimension: {}", engine.config().vector_dimension);
            println!("  config:    {}", paths.config.display());
        }

        Commands::Learn {
            content,
            embedding,
            embed,
            id,
            confidence,
            metadata,
        } => {
            let metadata = parse_metadata(&metadata)?;
            let engine = Engine::open(config)?;
            let id = if embed {
                let Some(url) = engine.config().embedding_url.clone() else {
                    miette::bail!("--embed needs embedding_url in the config or MNEMOS_EMBEDDING_URL");
                };
                let provider = HttpEmbeddingProvider::new(HttpEmbeddingConfig::new(url));
                engine.learn_text(&provider, &content, Vec::new())?
            } else {
                let embedding = embedding.as_deref().map(parse_vector).transpose()?.unwrap_or_default();
                let mut concept = NewConcept::from_content(content, embedding).with_metadata(metadata);
                if let Some(id) = id {
                    concept = concept.with_id(ConceptId::new(id)?);
                }
                if let Some(c) = confidence {
                    concept = concept.with_confidence(c);
                }
                engine.learn(concept, Vec::new())?
            };
            println!("{id}");
        }

        Commands::Associate {
            source,
            target,
            relation,
            confidence,
        } => {
            let engine = Engine::open(config)?;
            let assoc = NewAssociation::new(ConceptId::new(source)?, ConceptId::new(target)?, relation)
                .with_confidence(confidence);
            let seq = engine.learn_association(assoc)?;
            println!("logged at seq {seq}");
        }

        Commands::Strength { concept_id, delta } => {
            let engine = Engine::open(config)?;
            let id = ConceptId::new(concept_id)?;
            engine.update_strength(&id, delta)?;
            if let Some(c) = engine.get_concept(&id) {
                println!("{id}: strength {:.3}", c.strength);
            }
        }

        Commands::Delete { concept_id } => {
            let engine = Engine::open(config)?;
            let seq = engine.delete_concept(&ConceptId::new(concept_id)?)?;
            println!("deleted (seq {seq})");
        }

        Commands::Get { concept_id } => {
            let engine = Engine::open(config)?;
            let id = ConceptId::new(concept_id)?;
            let Some(concept) = engine.get_concept(&id) else {
                miette::bail!("concept {id} not found");
            };
            let out = serde_json::json!({
                "concept": concept,
                "outgoing": engine.graph().outgoing(&id),
                "incoming": engine.graph().incoming(&id),
            });
            println!("{}", serde_json::to_string_pretty(&out).into_diagnostic()?);
        }

        Commands::Search { embedding, k, exact } => {
            let engine = Engine::open(config)?;
            let query = parse_vector(&embedding)?;
            let hits = if exact {
                engine.vectors().search_exact(&query, k)?
            } else {
                engine.search(&query, k)?
            };
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                let content = engine
                    .get_concept(&hit.concept_id)
                    .map(|c| c.content)
                    .unwrap_or_default();
                println!(
                    "  {}. {} (distance: {:.4}) \"{}\"",
                    i + 1,
                    hit.concept_id,
                    hit.distance,
                    content
                );
            }
        }

        Commands::Text { query } => {
            let engine = Engine::open(config)?;
            for id in engine.graph().search_text(&query) {
                if let Some(c) = engine.get_concept(&id) {
                    println!("  {id} \"{}\"", c.content);
                }
            }
        }

        Commands::Stats => {
            let engine = Engine::open(config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&engine.stats()).into_diagnostic()?
            );
        }

        Commands::Health => {
            let engine = Engine::open(config)?;
            print_recovery(&engine);
            let health = engine.health();
            match health.status {
                HealthStatus::Healthy => println!("healthy"),
                HealthStatus::Degraded => {
                    println!("degraded");
                    for reason in &health.reasons {
                        println!("  - {reason}");
                    }
                }
            }
        }

        Commands::Flush => {
            let engine = Engine::open(config)?;
            let report = engine.flush()?;
            println!(
                "flushed through seq {} (graph {} B, index {} B, wal now {} B)",
                report.seq, report.graph_bytes, report.index_bytes, report.wal_bytes
            );
        }

        Commands::Wal {
            action: WalAction::Inspect { limit },
        } => {
            let engine = Engine::open(config)?;
            print_recovery(&engine);
            let wal = engine.wal();
            println!(
                "{}: {} bytes, last seq {}",
                wal.path().display(),
                wal.size_bytes(),
                wal.last_sequence()
            );
            let entries = wal.replay(0)?;
            for entry in entries.take(limit.unwrap_or(usize::MAX)) {
                let entry = entry?;
                let touched: Vec<String> = entry
                    .op
                    .touched_concepts()
                    .into_iter()
                    .map(|c| c.to_string())
                    .collect();
                println!(
                    "  #{:<8} {:>16} {:<16} {}",
                    entry.seq,
                    entry.timestamp,
                    entry.tag(),
                    touched.join(",")
                );
            }
        }

        Commands::Run => run(config)?,
    }

    Ok(())
}

/// Serve JSON-lines requests until EOF, SIGINT or SIGTERM, then flush.
fn run(config: EngineConfig) -> Result<()> {
    let engine = Arc::new(Engine::open(config)?);
    let api = Api::new(Arc::clone(&engine), None)?;
    let reconciler = Reconciler::start(Arc::clone(&engine)).into_diagnostic()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown)).into_diagnostic()?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown)).into_diagnostic()?;

    // Stdin is read on its own thread so signals are noticed while idle.
    let (tx, rx) = mpsc::channel::<String>();
    std::thread::Builder::new()
        .name("mnemos-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(|l| l.ok()) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .into_diagnostic()?;

    tracing::info!("serving requests on stdin");
    let creds = Credentials::anonymous();
    let mut stdout = std::io::stdout().lock();
    while !shutdown.load(Ordering::Relaxed) {
        let line = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => api.handle(&creds, req),
            Err(e) => Response::Error {
                code: "mnemos::api::bad_request".into(),
                message: e.to_string(),
            },
        };
        let encoded = serde_json::to_string(&response).into_diagnostic()?;
        writeln!(stdout, "{encoded}").into_diagnostic()?;
        stdout.flush().into_diagnostic()?;
    }

    tracing::info!("shutting down");
    reconciler.stop();
    engine.flush()?;
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<EngineConfig> {
    let file = cli.config.clone().or_else(|| {
        let dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var(mnemos::config::ENV_STORAGE_PATH).ok().map(PathBuf::from))
            .unwrap_or_else(|| EngineConfig::default().storage_path);
        let candidate = DataPaths::new(&dir).config;
        candidate.exists().then_some(candidate)
    });
    let base = match &file {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let mut config = base.with_overrides(|key| std::env::var(key).ok())?;
    if let Some(dir) = &cli.data_dir {
        config.storage_path = dir.clone();
    }
    if let Some(dim) = cli.dimension {
        config.vector_dimension = dim;
    }
    Ok(config)
}

fn parse_vector(raw: &str) -> Result<Vec<f32>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<f32>()
                .map_err(|e| miette::miette!("invalid vector component {s:?}: {e}"))
        })
        .collect()
}

fn parse_metadata(entries: &[String]) -> Result<Metadata> {
    entries
        .iter()
        .map(|e| {
            e.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| miette::miette!("metadata entry {e:?} is not key=value"))
        })
        .collect()
}

fn print_recovery(engine: &Engine) {
    let r = engine.recovery();
    let index = match &r.index {
        IndexSource::Loaded => "loaded".to_string(),
        IndexSource::Rebuilt { reason, skipped: 0 } => format!("rebuilt ({reason})"),
        IndexSource::Rebuilt { reason, skipped } => {
            format!("rebuilt ({reason}, {skipped} embeddings not indexed)")
        }
    };
    println!(
        "recovery: snapshot seq {}, {} entries replayed, index {}, {} in doubt, {:?}",
        r.snapshot_seq, r.replayed, index, r.in_doubt, r.duration
    );
    if let Some((offset, reason)) = &r.corrupt_tail {
        println!("  discarded corrupt WAL tail at byte {offset}: {reason}");
    }
}
