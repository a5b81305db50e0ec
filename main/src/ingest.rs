use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use common::{
    storage::db::SurrealDbClient,
    utils::{config::get_config, llm::LlmClient},
};
use ingestion_pipeline::pipeline::{discover_files, IngestPipeline};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Document-ingestion orchestrator for the regulatory corpus.
#[derive(Parser)]
#[command(name = "ingest", about = "Checkpointed document ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process specific files or every ingestible file in a folder.
    Process {
        /// Files to ingest.
        #[arg(long, num_args = 1..)]
        files: Vec<String>,
        /// Folder to scan for ingestible files.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Documents processed concurrently.
        #[arg(long)]
        concurrent: Option<usize>,
    },
    /// Continue every incomplete pipeline from its checkpoint.
    Resume,
    /// Show aggregate pipeline status.
    Status {
        /// Also write the status report to a file.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Re-attempt every quarantined chunk.
    RetryFailed,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized(&config.corpus, config.embedding_dimensions as usize)
        .await?;

    let llm = Arc::new(LlmClient::from_config(&config));
    let pipeline = IngestPipeline::new(db, llm, &config);

    match cli.command {
        Command::Process {
            mut files,
            folder,
            concurrent,
        } => {
            if let Some(folder) = folder {
                files.extend(discover_files(&folder).await?);
            }
            if files.is_empty() {
                error!("Nothing to process: pass --files or --folder");
                std::process::exit(2);
            }

            info!(documents = files.len(), "Starting ingest run");
            let outcomes = pipeline.process_many(files, concurrent).await;
            summarize(&outcomes);
        }
        Command::Resume => {
            let outcomes = pipeline.resume().await?;
            summarize(&outcomes);
        }
        Command::Status { report } => {
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if let Some(path) = report {
                pipeline.write_status_report(&path).await?;
                info!(path = %path.display(), "Status report written");
            }
        }
        Command::RetryFailed => {
            let recovered = pipeline.retry_failed_chunks().await?;
            info!(recovered, "Quarantine retry finished");
        }
    }

    Ok(())
}

fn summarize(
    outcomes: &[(
        String,
        Result<ingestion_pipeline::checkpoint::ProcessingCheckpoint, common::error::AppError>,
    )],
) {
    let succeeded = outcomes.iter().filter(|(_, result)| result.is_ok()).count();
    let failed = outcomes.len() - succeeded;
    info!(succeeded, failed, "Ingest run finished");

    for (file, result) in outcomes {
        match result {
            Ok(checkpoint) => info!(
                file,
                doc_id = %checkpoint.doc_id,
                chunks = checkpoint.chunks_count,
                stage = %checkpoint.current_stage(),
                "Document processed"
            ),
            Err(err) => error!(file, error = %err, "Document failed"),
        }
    }
}
