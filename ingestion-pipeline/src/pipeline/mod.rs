mod state;

use std::{path::PathBuf, sync::Arc};

use common::{
    error::AppError, storage::db::SurrealDbClient, utils::config::AppConfig,
    utils::llm::LlmClient,
};
use futures::{stream, StreamExt};
use serde::Serialize;
use state_machines::core::GuardError;
use tracing::{error, info, instrument, warn};

use crate::{
    checkpoint::{doc_id_for, ProcessingCheckpoint, Stage},
    chunk_processor::ChunkProcessor,
    extractor::DocumentExtractor,
    ingester::DataIngester,
    splitter::{SplitterConfig, TextSplitter},
    types::SplitChunk,
    utils::{load_json, save_json},
};

use state::{ready, Extracted, IngestMachine, Processed, Ready, Split};

/// File extensions the ingest orchestrator picks up.
const INGESTIBLE_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "tiff"];

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingest pipeline transition during {event}: {guard:?}"
    ))
}

/// Aggregate pipeline status over every checkpoint on disk.
#[derive(Debug, Default, Serialize)]
pub struct PipelineStatus {
    pub total_documents: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending_quarantine_files: usize,
    pub details: Vec<DocumentStatus>,
}

#[derive(Debug, Serialize)]
pub struct DocumentStatus {
    pub doc_id: String,
    pub file_path: String,
    pub stage: String,
    pub chunks_count: usize,
    pub progress: f32,
    pub error: Option<String>,
}

/// Checkpointed ingest driver: extraction, splitting, enrichment and
/// insertion for one document per run, resumable after a crash.
pub struct IngestPipeline {
    checkpoint_dir: PathBuf,
    llm: Arc<LlmClient>,
    extractor: DocumentExtractor,
    splitter: TextSplitter,
    processor: ChunkProcessor,
    ingester: DataIngester,
    max_concurrent_documents: usize,
}

impl IngestPipeline {
    pub fn new(db: Arc<SurrealDbClient>, llm: Arc<LlmClient>, config: &AppConfig) -> Self {
        let checkpoint_dir = PathBuf::from(&config.checkpoint_dir);
        let pending_dir = PathBuf::from(&config.pending_chunks_dir);

        Self {
            extractor: DocumentExtractor::new(
                Arc::clone(&llm),
                Arc::clone(&db),
                checkpoint_dir.clone(),
            ),
            splitter: TextSplitter::new(SplitterConfig::from_app_config(config)),
            processor: ChunkProcessor::new(Arc::clone(&llm), config.process_batch_size),
            ingester: DataIngester::new(
                db,
                config.corpus.clone(),
                checkpoint_dir.clone(),
                pending_dir,
                config.process_batch_size,
            ),
            llm,
            checkpoint_dir,
            max_concurrent_documents: config.max_concurrent_documents.max(1),
        }
    }

    /// Drives one document through every stage, skipping stages its
    /// checkpoint already completed. Failures are recorded on the checkpoint
    /// and stop only this document.
    #[instrument(skip(self), fields(doc_id = %doc_id_for(file_path)))]
    pub async fn process_file(&self, file_path: &str) -> Result<ProcessingCheckpoint, AppError> {
        let mut checkpoint =
            ProcessingCheckpoint::load_or_new(&self.checkpoint_dir, file_path).await?;
        if checkpoint.error.is_some() {
            info!("Retrying previously failed document");
            checkpoint.clear_error();
        }

        let machine = ready();
        let result = self.drive(machine, &mut checkpoint).await;

        if let Err(err) = &result {
            error!(error = %err, "Ingest pipeline failed for document");
            checkpoint.record_error(&err.to_string());
            checkpoint.save(&self.checkpoint_dir).await?;
        }

        result.map(|()| checkpoint)
    }

    async fn drive(
        &self,
        machine: IngestMachine<(), Ready>,
        checkpoint: &mut ProcessingCheckpoint,
    ) -> Result<(), AppError> {
        let machine = self.extract_stage(machine, checkpoint).await?;
        let machine = self.split_stage(machine, checkpoint).await?;
        let machine = self.process_stage(machine, checkpoint).await?;
        let _machine = self.ingest_stage(machine, checkpoint).await?;

        info!(
            doc_id = %checkpoint.doc_id,
            chunks = checkpoint.chunks_count,
            stage = %checkpoint.current_stage(),
            "Ingest pipeline finished for document"
        );
        Ok(())
    }

    async fn extract_stage(
        &self,
        machine: IngestMachine<(), Ready>,
        checkpoint: &mut ProcessingCheckpoint,
    ) -> Result<IngestMachine<(), Extracted>, AppError> {
        self.extractor.process(checkpoint).await?;
        machine
            .extract()
            .map_err(|(_, guard)| map_guard_error("extract", &guard))
    }

    async fn split_stage(
        &self,
        machine: IngestMachine<(), Extracted>,
        checkpoint: &mut ProcessingCheckpoint,
    ) -> Result<IngestMachine<(), Split>, AppError> {
        if !checkpoint.chunks_created {
            let text_path = checkpoint
                .text_file
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| checkpoint.text_artifact(&self.checkpoint_dir));
            let text = tokio::fs::read_to_string(&text_path).await?;

            let chunks = self
                .splitter
                .split(&text, checkpoint.metadata.as_ref(), &self.llm)
                .await?;

            let chunks_path = checkpoint.chunks_artifact(&self.checkpoint_dir);
            save_json(&chunks, &chunks_path).await?;

            checkpoint.chunks_file = Some(chunks_path.to_string_lossy().into_owned());
            checkpoint.chunks_count = chunks.len();
            checkpoint.chunks_created = true;
            checkpoint.save(&self.checkpoint_dir).await?;
            info!(chunks = chunks.len(), "Document split into chunks");
        }

        machine
            .split()
            .map_err(|(_, guard)| map_guard_error("split", &guard))
    }

    async fn process_stage(
        &self,
        machine: IngestMachine<(), Split>,
        checkpoint: &mut ProcessingCheckpoint,
    ) -> Result<IngestMachine<(), Processed>, AppError> {
        if !checkpoint.chunks_processed {
            let chunks_path = checkpoint
                .chunks_file
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| checkpoint.chunks_artifact(&self.checkpoint_dir));
            let chunks: Vec<SplitChunk> = load_json(&chunks_path).await?;

            let processed = self
                .processor
                .process_chunks(
                    &chunks,
                    &checkpoint.file_path,
                    checkpoint.document_id_db.as_deref(),
                    checkpoint.metadata.as_ref(),
                )
                .await?;

            let processed_path = checkpoint.processed_artifact(&self.checkpoint_dir);
            save_json(&processed, &processed_path).await?;

            checkpoint.processed_file = Some(processed_path.to_string_lossy().into_owned());
            checkpoint.chunks_processed = true;
            checkpoint.save(&self.checkpoint_dir).await?;
            info!(chunks = processed.len(), "Chunks enriched");
        }

        machine
            .process()
            .map_err(|(_, guard)| map_guard_error("process", &guard))
    }

    async fn ingest_stage(
        &self,
        machine: IngestMachine<(), Processed>,
        checkpoint: &mut ProcessingCheckpoint,
    ) -> Result<IngestMachine<(), state::Ingested>, AppError> {
        self.ingester.ingest(checkpoint).await?;
        machine
            .ingest()
            .map_err(|(_, guard)| map_guard_error("ingest", &guard))
    }

    /// Processes several documents with bounded concurrency. One document's
    /// failure never stops the others.
    pub async fn process_many(
        &self,
        files: Vec<String>,
        concurrent: Option<usize>,
    ) -> Vec<(String, Result<ProcessingCheckpoint, AppError>)> {
        let limit = concurrent
            .unwrap_or(self.max_concurrent_documents)
            .max(1);

        stream::iter(files.into_iter().map(|file| async move {
            let outcome = self.process_file(&file).await;
            if let Err(err) = &outcome {
                warn!(file, error = %err, "Document ingest failed");
            }
            (file, outcome)
        }))
        .buffer_unordered(limit)
        .collect()
        .await
    }

    /// Resumes every incomplete, non-failed-beyond-retry pipeline from its
    /// checkpoint.
    pub async fn resume(&self) -> Result<Vec<(String, Result<ProcessingCheckpoint, AppError>)>, AppError> {
        let mut pending = Vec::new();
        for checkpoint in self.load_checkpoints().await? {
            if !checkpoint.ingested {
                pending.push(checkpoint.file_path);
            }
        }

        if pending.is_empty() {
            info!("No incomplete pipelines to resume");
            return Ok(Vec::new());
        }

        info!(documents = pending.len(), "Resuming incomplete pipelines");
        Ok(self.process_many(pending, None).await)
    }

    /// Retries every quarantined chunk file.
    pub async fn retry_failed_chunks(&self) -> Result<usize, AppError> {
        let files = self.ingester.pending_files().await?;
        let mut recovered = 0usize;
        for file in files {
            let outcome = self.ingester.retry_failed(&file).await?;
            recovered += outcome.succeeded;
        }
        Ok(recovered)
    }

    pub async fn status(&self) -> Result<PipelineStatus, AppError> {
        let checkpoints = self.load_checkpoints().await?;
        let mut status = PipelineStatus {
            total_documents: checkpoints.len(),
            ..PipelineStatus::default()
        };

        for checkpoint in checkpoints {
            match checkpoint.current_stage() {
                Stage::Completed => status.completed += 1,
                Stage::Failed => status.failed += 1,
                _ => status.in_progress += 1,
            }
            status.details.push(DocumentStatus {
                doc_id: checkpoint.doc_id.clone(),
                file_path: checkpoint.file_path.clone(),
                stage: checkpoint.current_stage().to_string(),
                chunks_count: checkpoint.chunks_count,
                progress: checkpoint.progress_percentage(),
                error: checkpoint.error,
            });
        }

        status.pending_quarantine_files = self.ingester.pending_files().await?.len();
        Ok(status)
    }

    pub async fn write_status_report(&self, path: &std::path::Path) -> Result<(), AppError> {
        let status = self.status().await?;
        save_json(&status, path).await
    }

    async fn load_checkpoints(&self) -> Result<Vec<ProcessingCheckpoint>, AppError> {
        let mut checkpoints = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.checkpoint_dir).await else {
            return Ok(checkpoints);
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with("_checkpoint.json") {
                continue;
            }
            match load_json::<ProcessingCheckpoint>(&entry.path()).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => warn!(file = %name, error = %err, "Skipping unreadable checkpoint"),
            }
        }
        checkpoints.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(checkpoints)
    }
}

/// Files under `folder` eligible for ingestion, by extension.
pub async fn discover_files(folder: &std::path::Path) -> Result<Vec<String>, AppError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(extension) = path.extension() else {
            continue;
        };
        let extension = extension.to_string_lossy().to_lowercase();
        if INGESTIBLE_EXTENSIONS.contains(&extension.as_str()) {
            files.push(path.to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}
