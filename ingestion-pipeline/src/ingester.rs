use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk::ProcessedChunk},
};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    checkpoint::ProcessingCheckpoint,
    utils::{load_json, save_json},
};

/// Pause between insert batches.
const INSERT_BATCH_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct QuarantinedChunk {
    pub chunk: ProcessedChunk,
    pub error: String,
    pub retry_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuarantineFile {
    pub doc_id: String,
    pub timestamp: String,
    pub total_failed: usize,
    pub chunks: Vec<QuarantinedChunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub total: usize,
    pub inserted: usize,
    pub quarantined: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub still_failing: usize,
}

/// Chunk row id derived from the source identity, so a re-run of a partially
/// ingested document cannot duplicate rows.
fn chunk_row_id(chunk: &ProcessedChunk) -> String {
    let digest = Md5::digest(format!("{}#{}", chunk.url, chunk.chunk_number).as_bytes());
    format!("{digest:x}").chars().take(16).collect()
}

/// Inserts processed chunks into the corpus table, quarantining failures
/// for later retry.
pub struct DataIngester {
    db: Arc<SurrealDbClient>,
    corpus: String,
    checkpoint_dir: PathBuf,
    pending_dir: PathBuf,
    batch_size: usize,
}

impl DataIngester {
    pub fn new(
        db: Arc<SurrealDbClient>,
        corpus: String,
        checkpoint_dir: PathBuf,
        pending_dir: PathBuf,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            corpus,
            checkpoint_dir,
            pending_dir,
            batch_size: batch_size.max(1),
        }
    }

    #[instrument(skip_all, fields(doc_id = %checkpoint.doc_id))]
    pub async fn ingest(
        &self,
        checkpoint: &mut ProcessingCheckpoint,
    ) -> Result<IngestOutcome, AppError> {
        if checkpoint.ingested {
            info!("Document already ingested; skipping");
            return Ok(IngestOutcome {
                total: checkpoint.chunks_count,
                inserted: checkpoint.chunks_count,
                quarantined: 0,
            });
        }

        let processed_path = checkpoint
            .processed_file
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| checkpoint.processed_artifact(&self.checkpoint_dir));
        let chunks: Vec<ProcessedChunk> = load_json(&processed_path).await?;

        info!(chunks = chunks.len(), "Inserting processed chunks");

        let mut inserted = 0usize;
        let mut failed: Vec<QuarantinedChunk> = Vec::new();

        let total = chunks.len();
        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            for chunk in batch {
                match self.insert_chunk(chunk).await {
                    Ok(()) => inserted += 1,
                    Err(err) => {
                        warn!(
                            chunk_number = chunk.chunk_number,
                            error = %err,
                            "Chunk insert failed; quarantining"
                        );
                        failed.push(QuarantinedChunk {
                            chunk: chunk.clone(),
                            error: err.to_string(),
                            retry_count: 1,
                        });
                    }
                }
            }

            let consumed = (batch_index + 1) * self.batch_size;
            if consumed < total {
                tokio::time::sleep(INSERT_BATCH_PAUSE).await;
            }
        }

        let quarantined = failed.len();
        if !failed.is_empty() {
            self.save_quarantine(&checkpoint.doc_id, failed).await?;
        }

        checkpoint.ingested = quarantined == 0;
        checkpoint.completed_at = Some(Utc::now().to_rfc3339());
        checkpoint.save(&self.checkpoint_dir).await?;

        info!(inserted, quarantined, total, "Ingest finished");
        Ok(IngestOutcome {
            total,
            inserted,
            quarantined,
        })
    }

    async fn insert_chunk(&self, chunk: &ProcessedChunk) -> Result<(), AppError> {
        let mut stored = chunk.clone().into_stored();
        stored.id = chunk_row_id(chunk);
        stored.insert(&self.corpus, &self.db).await
    }

    async fn save_quarantine(
        &self,
        doc_id: &str,
        chunks: Vec<QuarantinedChunk>,
    ) -> Result<(), AppError> {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let path = self
            .pending_dir
            .join(format!("{doc_id}_failed_{timestamp}.json"));

        let file = QuarantineFile {
            doc_id: doc_id.to_owned(),
            timestamp: Utc::now().to_rfc3339(),
            total_failed: chunks.len(),
            chunks,
        };
        save_json(&file, &path).await?;
        warn!(path = %path.display(), failed = file.total_failed, "Quarantine file written");
        Ok(())
    }

    /// Re-attempts every quarantined chunk in `path`. Chunks that still fail
    /// are rewritten with an incremented retry count; the file is deleted
    /// when everything succeeds.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, path: &Path) -> Result<RetryOutcome, AppError> {
        let mut file: QuarantineFile = load_json(path).await?;
        let total = file.chunks.len();

        let mut still_failing = Vec::new();
        let mut succeeded = 0usize;

        for entry in file.chunks {
            match self.insert_chunk(&entry.chunk).await {
                Ok(()) => succeeded += 1,
                Err(err) => still_failing.push(QuarantinedChunk {
                    chunk: entry.chunk,
                    error: err.to_string(),
                    retry_count: entry.retry_count + 1,
                }),
            }
        }

        let remaining = still_failing.len();
        if still_failing.is_empty() {
            tokio::fs::remove_file(path).await?;
            info!(total, "All quarantined chunks inserted; file removed");

            // The document is fully ingested once its quarantine drains.
            if let Some(mut checkpoint) =
                ProcessingCheckpoint::load(&self.checkpoint_dir, &file.doc_id).await?
            {
                if !self.has_pending_files(&file.doc_id).await {
                    checkpoint.ingested = true;
                    checkpoint.completed_at = Some(Utc::now().to_rfc3339());
                    checkpoint.save(&self.checkpoint_dir).await?;
                }
            }
        } else {
            file.total_failed = remaining;
            file.timestamp = Utc::now().to_rfc3339();
            file.chunks = still_failing;
            save_json(&file, path).await?;
            warn!(remaining, "Quarantine retry left chunks failing");
        }

        Ok(RetryOutcome {
            total,
            succeeded,
            still_failing: remaining,
        })
    }

    /// Quarantine files currently pending, optionally scoped to a document.
    pub async fn pending_files(&self) -> Result<Vec<PathBuf>, AppError> {
        let mut files = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.pending_dir).await else {
            return Ok(files);
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains("_failed_") && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn has_pending_files(&self, doc_id: &str) -> bool {
        match self.pending_files().await {
            Ok(files) => files.iter().any(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().starts_with(doc_id))
                    .unwrap_or(false)
            }),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::{ChunkMetadata, StoredChunk};
    use uuid::Uuid;

    const TEST_CORPUS: &str = "pd_test";

    fn processed_chunk(number: i64) -> ProcessedChunk {
        ProcessedChunk {
            url: "/docs/ley.pdf".into(),
            chunk_number: number,
            title: format!("Artículo {number}"),
            summary: "contexto".into(),
            content: format!("contenido del artículo {number}"),
            metadata: ChunkMetadata::default(),
            embedding: vec![0.1, 0.2, 0.3],
            document_id: None,
        }
    }

    async fn setup() -> (Arc<SurrealDbClient>, DataIngester, tempfile::TempDir) {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized(TEST_CORPUS, 3).await.expect("indexes");

        let dir = tempfile::tempdir().expect("tempdir");
        let ingester = DataIngester::new(
            Arc::clone(&db),
            TEST_CORPUS.into(),
            dir.path().join("checkpoints"),
            dir.path().join("pending_chunks"),
            5,
        );
        (db, ingester, dir)
    }

    async fn write_processed(
        ingester: &DataIngester,
        checkpoint: &mut ProcessingCheckpoint,
        chunks: &[ProcessedChunk],
    ) {
        let path = checkpoint.processed_artifact(&ingester.checkpoint_dir);
        save_json(&chunks.to_vec(), &path).await.expect("artifact");
        checkpoint.processed_file = Some(path.to_string_lossy().into_owned());
        checkpoint.chunks_processed = true;
        checkpoint.metadata_extracted = true;
        checkpoint.text_extracted = true;
        checkpoint.chunks_created = true;
        checkpoint.chunks_count = chunks.len();
    }

    #[tokio::test]
    async fn ingests_all_chunks_and_marks_checkpoint() {
        let (db, ingester, _dir) = setup().await;
        let mut checkpoint = ProcessingCheckpoint::new("/docs/ley.pdf");
        let chunks: Vec<ProcessedChunk> = (0..3).map(processed_chunk).collect();
        write_processed(&ingester, &mut checkpoint, &chunks).await;

        let outcome = ingester.ingest(&mut checkpoint).await.expect("ingest");

        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.quarantined, 0);
        assert!(checkpoint.ingested);
        assert!(checkpoint.completed_at.is_some());

        let rows = StoredChunk::scan_all(TEST_CORPUS, &db).await.expect("scan");
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn reingesting_produces_no_duplicate_rows() {
        let (db, ingester, _dir) = setup().await;
        let mut checkpoint = ProcessingCheckpoint::new("/docs/ley.pdf");
        let chunks: Vec<ProcessedChunk> = (0..2).map(processed_chunk).collect();
        write_processed(&ingester, &mut checkpoint, &chunks).await;

        ingester.ingest(&mut checkpoint).await.expect("first ingest");
        // Second run is skipped outright thanks to the checkpoint flag.
        let outcome = ingester.ingest(&mut checkpoint).await.expect("second ingest");
        assert_eq!(outcome.quarantined, 0);

        let rows = StoredChunk::scan_all(TEST_CORPUS, &db).await.expect("scan");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn failed_inserts_are_quarantined_with_retry_count_one() {
        let (db, ingester, _dir) = setup().await;
        let mut checkpoint = ProcessingCheckpoint::new("/docs/ley.pdf");
        let chunks: Vec<ProcessedChunk> = (0..3).map(processed_chunk).collect();
        write_processed(&ingester, &mut checkpoint, &chunks).await;

        // Pre-insert chunk 1's row id so its insert collides.
        ingester
            .insert_chunk(&chunks[1])
            .await
            .expect("pre-insert");

        let outcome = ingester.ingest(&mut checkpoint).await.expect("ingest");
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.quarantined, 1);
        assert!(!checkpoint.ingested);

        let pending = ingester.pending_files().await.expect("pending");
        assert_eq!(pending.len(), 1);
        let file: QuarantineFile = load_json(&pending[0]).await.expect("quarantine");
        assert_eq!(file.total_failed, 1);
        assert_eq!(file.chunks[0].retry_count, 1);
        assert_eq!(file.chunks[0].chunk.chunk_number, 1);

        let rows = StoredChunk::scan_all(TEST_CORPUS, &db).await.expect("scan");
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn retry_drains_quarantine_and_completes_checkpoint() {
        let (db, ingester, _dir) = setup().await;
        let mut checkpoint = ProcessingCheckpoint::new("/docs/ley.pdf");
        let chunks: Vec<ProcessedChunk> = (0..2).map(processed_chunk).collect();
        write_processed(&ingester, &mut checkpoint, &chunks).await;

        ingester.insert_chunk(&chunks[0]).await.expect("collision");
        ingester.ingest(&mut checkpoint).await.expect("ingest");
        assert!(!checkpoint.ingested);

        // Clear the collision so the retry can succeed.
        let conflicting = chunk_row_id(&chunks[0]);
        let _dropped: Option<StoredChunk> = db
            .client
            .delete((TEST_CORPUS, conflicting.as_str()))
            .await
            .expect("delete");

        let pending = ingester.pending_files().await.expect("pending");
        let outcome = ingester.retry_failed(&pending[0]).await.expect("retry");
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.still_failing, 0);
        assert!(!pending[0].exists());

        let reloaded = ProcessingCheckpoint::load(&ingester.checkpoint_dir, &checkpoint.doc_id)
            .await
            .expect("load")
            .expect("present");
        assert!(reloaded.ingested);
    }

    #[tokio::test]
    async fn retry_increments_count_for_still_failing_chunks() {
        let (_db, ingester, _dir) = setup().await;
        let mut checkpoint = ProcessingCheckpoint::new("/docs/ley.pdf");
        let chunks: Vec<ProcessedChunk> = (0..1).map(processed_chunk).collect();
        write_processed(&ingester, &mut checkpoint, &chunks).await;

        ingester.insert_chunk(&chunks[0]).await.expect("collision");
        ingester.ingest(&mut checkpoint).await.expect("ingest");

        // Collision still present: retry fails again and increments.
        let pending = ingester.pending_files().await.expect("pending");
        let outcome = ingester.retry_failed(&pending[0]).await.expect("retry");
        assert_eq!(outcome.still_failing, 1);

        let file: QuarantineFile = load_json(&pending[0]).await.expect("quarantine");
        assert_eq!(file.chunks[0].retry_count, 2);
    }
}
