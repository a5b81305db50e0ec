use std::path::{Path, PathBuf};

use chrono::Utc;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::error::AppError;

use crate::types::DocumentMetadata;

/// Stable 12-hex document id derived from the file path.
pub fn doc_id_for(file_path: &str) -> String {
    let digest = Md5::digest(file_path.as_bytes());
    format!("{digest:x}").chars().take(12).collect()
}

/// Stage the ingest pipeline is at for one document, derived from the
/// checkpoint flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    NotStarted,
    MetadataExtracted,
    TextExtracted,
    ChunksCreated,
    ChunksProcessed,
    Completed,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::NotStarted => "not_started",
            Stage::MetadataExtracted => "metadata_extracted",
            Stage::TextExtracted => "text_extracted",
            Stage::ChunksCreated => "chunks_created",
            Stage::ChunksProcessed => "chunks_processed",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Per-document ingest state, persisted as a JSON file and rewritten after
/// every stage transition so a crashed run resumes where it stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingCheckpoint {
    pub doc_id: String,
    pub file_path: String,
    #[serde(default)]
    pub metadata_extracted: bool,
    #[serde(default)]
    pub text_extracted: bool,
    #[serde(default)]
    pub chunks_created: bool,
    #[serde(default)]
    pub chunks_processed: bool,
    #[serde(default)]
    pub ingested: bool,
    #[serde(default)]
    pub metadata: Option<DocumentMetadata>,
    #[serde(default)]
    pub text_file: Option<String>,
    #[serde(default)]
    pub chunks_file: Option<String>,
    #[serde(default)]
    pub chunks_count: usize,
    #[serde(default)]
    pub processed_file: Option<String>,
    #[serde(default)]
    pub document_id_db: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failed_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    pub started_at: String,
}

impl ProcessingCheckpoint {
    pub fn new(file_path: &str) -> Self {
        Self {
            doc_id: doc_id_for(file_path),
            file_path: file_path.to_owned(),
            metadata_extracted: false,
            text_extracted: false,
            chunks_created: false,
            chunks_processed: false,
            ingested: false,
            metadata: None,
            text_file: None,
            chunks_file: None,
            chunks_count: 0,
            processed_file: None,
            document_id_db: None,
            error: None,
            failed_at: None,
            completed_at: None,
            started_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn path_in(checkpoint_dir: &Path, doc_id: &str) -> PathBuf {
        checkpoint_dir.join(format!("{doc_id}_checkpoint.json"))
    }

    pub async fn load(checkpoint_dir: &Path, doc_id: &str) -> Result<Option<Self>, AppError> {
        let path = Self::path_in(checkpoint_dir, doc_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Loads the checkpoint for a file, or starts a fresh one.
    pub async fn load_or_new(checkpoint_dir: &Path, file_path: &str) -> Result<Self, AppError> {
        let doc_id = doc_id_for(file_path);
        match Self::load(checkpoint_dir, &doc_id).await? {
            Some(checkpoint) => Ok(checkpoint),
            None => Ok(Self::new(file_path)),
        }
    }

    pub async fn save(&self, checkpoint_dir: &Path) -> Result<(), AppError> {
        tokio::fs::create_dir_all(checkpoint_dir).await?;
        let path = Self::path_in(checkpoint_dir, &self.doc_id);
        let payload = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, payload).await?;
        debug!(doc_id = %self.doc_id, stage = %self.current_stage(), "Checkpoint saved");
        Ok(())
    }

    pub fn record_error(&mut self, error: &str) {
        self.error = Some(error.to_owned());
        self.failed_at = Some(Utc::now().to_rfc3339());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.failed_at = None;
    }

    pub fn current_stage(&self) -> Stage {
        if self.error.is_some() {
            Stage::Failed
        } else if self.ingested {
            Stage::Completed
        } else if self.chunks_processed {
            Stage::ChunksProcessed
        } else if self.chunks_created {
            Stage::ChunksCreated
        } else if self.text_extracted {
            Stage::TextExtracted
        } else if self.metadata_extracted {
            Stage::MetadataExtracted
        } else {
            Stage::NotStarted
        }
    }

    /// The stage flags must advance monotonically: a later flag implies all
    /// earlier flags, unless the document failed.
    pub fn flags_consistent(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        let flags = [
            self.metadata_extracted,
            self.text_extracted,
            self.chunks_created,
            self.chunks_processed,
            self.ingested,
        ];
        flags.windows(2).all(|pair| pair[0] || !pair[1])
    }

    pub fn progress_percentage(&self) -> f32 {
        let flags = [
            self.metadata_extracted,
            self.text_extracted,
            self.chunks_created,
            self.chunks_processed,
            self.ingested,
        ];
        let completed = flags.iter().filter(|flag| **flag).count();
        completed as f32 / flags.len() as f32 * 100.0
    }

    pub fn text_artifact(&self, checkpoint_dir: &Path) -> PathBuf {
        checkpoint_dir.join(format!("{}_text.txt", self.doc_id))
    }

    pub fn chunks_artifact(&self, checkpoint_dir: &Path) -> PathBuf {
        checkpoint_dir.join(format!("{}_chunks.json", self.doc_id))
    }

    pub fn processed_artifact(&self, checkpoint_dir: &Path) -> PathBuf {
        checkpoint_dir.join(format!("{}_processed.json", self.doc_id))
    }
}
