//! CLI interface for the face index cache

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch::server::{self, AppState};
use facematch::{
    Embedding, FaceRecord, FaceSource, FaceStore, FileKv, JsonFaceStore, Matcher, MatcherConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facematch")]
#[command(about = "Face embedding index cache for face recognition", long_about = None)]
struct Cli {
    /// Data directory holding the key-value store and the face records
    #[arg(long, env = "FACEMATCH_DATA_DIR", default_value = "./facematch-data")]
    data_dir: PathBuf,

    /// Matcher configuration as JSON. Defaults apply when unset.
    #[arg(long, env = "FACEMATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0:3000")]
        addr: String,
    },
    /// Build a collection's index from its face records
    Create {
        collection: String,
    },
    /// Store a face record and register it with the index
    Add {
        collection: String,
        /// Person the face belongs to
        person_id: i64,
        /// Embedding as comma-separated values (e.g., "0.1,0.2,0.3")
        #[arg(short, long)]
        embedding: String,
    },
    /// Find the closest person for an embedding
    Search {
        collection: String,
        /// Embedding as comma-separated values
        embedding: String,
        /// Number of results to return
        #[arg(short, long, default_value = "1")]
        k: usize,
    },
    /// Remove every face of a person
    DeletePerson {
        collection: String,
        person_id: i64,
    },
    /// Delete a single face record by its id
    DeleteFace {
        collection: String,
        face_id: String,
    },
    /// Rebuild one collection, or all of them, from the face records
    Rebuild {
        collection: Option<String>,
    },
    /// Show index statistics for a collection
    Stats {
        collection: String,
    },
    /// List collections and their indexes
    List,
    /// Drop a collection's index and face records
    Drop {
        collection: String,
    },
}

async fn run(matcher: Arc<Matcher>, faces: Arc<JsonFaceStore>, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { addr } => {
            let ready = matcher.initialize().await?;
            tracing::info!(ready, "startup index check finished");
            server::serve(&addr, AppState::new(matcher, faces)).await?;
        }
        Commands::Create { collection } => {
            if matcher.create_index(&collection).await? {
                let stats = matcher.get_index_stats(&collection).await?;
                println!("Created index for {} ({} faces)", collection, stats.count);
            } else {
                println!("Index for {} already exists", collection);
            }
        }
        Commands::Add {
            collection,
            person_id,
            embedding,
        } => {
            let e = Embedding::parse_csv(&embedding)?;
            e.check_dimension(matcher.config().dimension)?;
            e.normalized()?;

            let face_id = faces
                .insert_face(&collection, FaceRecord::new(person_id, e.as_slice().to_vec()))
                .await?;
            matcher.add_face(&collection, &e, person_id, &face_id).await?;
            println!("Added face {} for person {}", face_id, person_id);
        }
        Commands::Search {
            collection,
            embedding,
            k,
        } => {
            let e = Embedding::parse_csv(&embedding)?;
            let matches = matcher.search_top_k(&collection, &e, k).await?;

            if matches.is_empty() {
                println!("No match (collection is missing or empty)");
            } else {
                println!("Top {} results:", matches.len());
                for (i, m) in matches.iter().enumerate() {
                    println!(
                        "{}. person {} (similarity: {:.2}%)",
                        i + 1,
                        m.person_id,
                        facematch::distance::similarity_percent(m.score)
                    );
                }
            }
        }
        Commands::DeletePerson {
            collection,
            person_id,
        } => {
            let records = faces.delete_person(&collection, person_id).await?;
            let entries = matcher.delete_person(&collection, person_id).await?;
            println!(
                "Deleted person {}: {} records, {} index entries",
                person_id, records, entries
            );
        }
        Commands::DeleteFace {
            collection,
            face_id,
        } => {
            let record = faces.delete_face(&collection, &face_id).await?;
            let entry = matcher.delete_face(&collection, &face_id).await?;
            println!(
                "Deleted face {}: record {}, index entry {}",
                face_id,
                if record { "removed" } else { "not found" },
                if entry { "removed" } else { "not found" }
            );
        }
        Commands::Rebuild { collection } => match collection {
            Some(collection) => {
                let count = matcher.update_index(&collection).await?;
                println!("Rebuilt {} ({} faces)", collection, count);
            }
            None => {
                let rebuilt = matcher.update_all().await?;
                println!("Rebuilt {} collections", rebuilt);
            }
        },
        Commands::Stats { collection } => {
            let stats = matcher.get_index_stats(&collection).await?;
            println!("Collection: {}", collection);
            println!("  faces:     {}", stats.count);
            println!("  labels:    {}", stats.labels);
            println!("  dimension: {}", stats.dimension);
        }
        Commands::List => {
            let collections = faces.list_collections().await?;
            let indexed = matcher.list_indexes().await?;
            if collections.is_empty() && indexed.is_empty() {
                println!("No collections");
            } else {
                let mut names = collections;
                names.extend(indexed.iter().cloned());
                names.sort();
                names.dedup();
                println!("Collections ({} total):", names.len());
                for name in names {
                    let marker = if indexed.contains(&name) { "indexed" } else { "not indexed" };
                    println!("  - {} ({})", name, marker);
                }
            }
        }
        Commands::Drop { collection } => {
            let had_index = matcher.delete_index(&collection).await?;
            let had_records = faces.drop_collection(&collection).await?;
            if !had_index && !had_records {
                anyhow::bail!("collection not found: {}", collection);
            }
            println!("Dropped {}", collection);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MatcherConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MatcherConfig::default(),
    };

    tokio::fs::create_dir_all(&cli.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", cli.data_dir.display()))?;
    let kv = Arc::new(FileKv::open(cli.data_dir.join("kv")).await?);
    let faces = Arc::new(JsonFaceStore::new(cli.data_dir.join("faces.json")));
    let matcher = Arc::new(Matcher::new(config, kv, faces.clone())?);

    run(matcher, faces, cli.command).await
}
