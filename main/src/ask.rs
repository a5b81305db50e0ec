use std::sync::Arc;

use clap::Parser;
use common::{
    storage::db::SurrealDbClient,
    utils::{config::get_config, llm::LlmClient},
};
use orchestrator::Orchestrator;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// One-shot regulatory question answering against the indexed corpus.
#[derive(Parser)]
#[command(name = "ask", about = "Ask a question over the regulatory corpus")]
struct Cli {
    /// The question to answer.
    query: String,
    /// User owning the conversation session.
    #[arg(long, default_value = "cli")]
    user: String,
    /// Existing session to continue.
    #[arg(long)]
    session: Option<String>,
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
    let orchestrator = Orchestrator::new(db, llm, &config);

    match orchestrator
        .process_query(&cli.query, &cli.user, cli.session.as_deref())
        .await
    {
        Ok(outcome) => {
            println!("{}", outcome.response);
            if let Some(report_path) = outcome.additional_info.get("report_path") {
                eprintln!("reporte: {report_path}");
            }
            eprintln!("session: {}", outcome.session_id);
        }
        Err(err) => {
            // Stack traces never reach the user; one short blurb only.
            tracing::error!(error = %err, "Query processing failed");
            println!("No fue posible procesar la consulta en este momento.");
            std::process::exit(1);
        }
    }

    Ok(())
}
