use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use chrono::{NaiveDate, Utc};
use common::{
    error::AppError, storage::db::SurrealDbClient, utils::llm::LlmClient,
};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::{
    checkpoint::ProcessingCheckpoint,
    types::{DocumentMetadata, ExtractedText},
    utils::{
        markdown::{clean_headers_footers, to_markdown},
        pdf,
    },
};

/// Pages sampled from a PDF for the metadata prompt.
const METADATA_SAMPLE_PAGES: usize = 3;
/// Character cap for non-PDF metadata samples (~200 KB).
const METADATA_SAMPLE_CHARS: usize = 200_000;

const METADATA_SYSTEM: &str = "Eres un analista de documentos normativos. A partir del texto \
inicial de un documento, devuelve un objeto JSON con los campos: document_type (Ley, \
Reglamento, Decreto, Circular, Norma, Resolución, Acuerdo u otro), document_title, \
issuing_authority, publication_date, effective_date, jurisdiction, status (vigente o \
derogado si se puede determinar), document_number y official_source. Usa null para los \
campos que no puedan determinarse. No inventes valores.";

fn spanish_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?i)(\d{1,2})\s+de\s+([a-záéíóú]+)\s+de\s+(\d{4})").unwrap()
    })
}

/// Best-effort normalization to an ISO-8601 date. Returns `None` when the
/// input cannot be parsed; callers then keep the original string.
pub fn normalize_date(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    for format in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }

    if let Some(caps) = spanish_date_pattern().captures(trimmed) {
        let day: u32 = caps.get(1)?.as_str().parse().ok()?;
        let month = match caps.get(2)?.as_str().to_lowercase().as_str() {
            "enero" => 1,
            "febrero" => 2,
            "marzo" => 3,
            "abril" => 4,
            "mayo" => 5,
            "junio" => 6,
            "julio" => 7,
            "agosto" => 8,
            "septiembre" => 9,
            "octubre" => 10,
            "noviembre" => 11,
            "diciembre" => 12,
            _ => return None,
        };
        let year: i32 = caps.get(3)?.as_str().parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day)
            .map(|date| date.format("%Y-%m-%d").to_string());
    }

    None
}

fn file_extension(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn is_image(extension: &str) -> bool {
    matches!(extension, "png" | "jpg" | "jpeg" | "tiff")
}

/// Produces document metadata, a Markdown text artifact and a checkpoint
/// record from a source file.
pub struct DocumentExtractor {
    llm: Arc<LlmClient>,
    db: Arc<SurrealDbClient>,
    checkpoint_dir: PathBuf,
}

impl DocumentExtractor {
    pub fn new(llm: Arc<LlmClient>, db: Arc<SurrealDbClient>, checkpoint_dir: PathBuf) -> Self {
        Self {
            llm,
            db,
            checkpoint_dir,
        }
    }

    /// Extracts document metadata via the LLM. Never fails: extraction
    /// errors produce a minimal record with `extraction_error` set.
    #[instrument(skip(self))]
    pub async fn extract_metadata(&self, file_path: &str) -> DocumentMetadata {
        match self.try_extract_metadata(file_path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = %err, file_path, "Metadata extraction failed");
                DocumentMetadata::failed(file_path, &err.to_string())
            }
        }
    }

    async fn try_extract_metadata(&self, file_path: &str) -> Result<DocumentMetadata, AppError> {
        let sample = self.metadata_sample(Path::new(file_path)).await?;
        let user = format!("Archivo: {file_path}\n\nTexto inicial del documento:\n{sample}");

        let mut metadata: DocumentMetadata = self
            .llm
            .chat_json(&self.llm.llm_model, METADATA_SYSTEM, &user)
            .await?;

        if let Some(date) = metadata.publication_date.as_deref().and_then(normalize_date) {
            metadata.publication_date = Some(date);
        }
        if let Some(date) = metadata.effective_date.as_deref().and_then(normalize_date) {
            metadata.effective_date = Some(date);
        }

        metadata.original_url = Some(file_path.to_owned());
        metadata.file_name = Path::new(file_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        metadata.extraction_date = Some(Utc::now().to_rfc3339());

        Ok(metadata)
    }

    async fn metadata_sample(&self, path: &Path) -> Result<String, AppError> {
        let extension = file_extension(path);
        if extension == "pdf" {
            return pdf::first_pages_text(path, METADATA_SAMPLE_PAGES, METADATA_SAMPLE_CHARS)
                .await;
        }
        if is_image(&extension) {
            // Image metadata is whatever the filename carries; the LLM sees
            // an empty body and fills what it can.
            return Ok(String::new());
        }

        let raw = tokio::fs::read_to_string(path).await?;
        Ok(raw.chars().take(METADATA_SAMPLE_CHARS).collect())
    }

    /// Extracts the text of a source file, using the OCR-style vision
    /// fallback for PDFs without a usable text layer and for images.
    #[instrument(skip(self))]
    pub async fn extract_text(&self, file_path: &str) -> Result<ExtractedText, AppError> {
        let path = Path::new(file_path);
        let extension = file_extension(path);

        if extension == "pdf" {
            return pdf::extract_pdf_content(path, &self.llm).await;
        }
        if is_image(&extension) {
            return pdf::extract_image_content(path, &self.llm).await;
        }

        let content = tokio::fs::read_to_string(path).await?;
        Ok(ExtractedText {
            content,
            page_count: 1,
            extraction_method: "plain_text".into(),
        })
    }

    /// Converts extracted text to cleaned Markdown.
    pub fn to_markdown_document(text: &str, document_title: Option<&str>) -> String {
        let markdown = to_markdown(text);
        clean_headers_footers(&markdown, document_title)
    }

    /// Runs the extraction stages against the checkpoint, skipping stages a
    /// previous run already completed.
    #[instrument(skip_all, fields(doc_id = %checkpoint.doc_id))]
    pub async fn process(&self, checkpoint: &mut ProcessingCheckpoint) -> Result<(), AppError> {
        if !checkpoint.metadata_extracted {
            let metadata = self.extract_metadata(&checkpoint.file_path).await;
            checkpoint.metadata = Some(metadata);
            checkpoint.metadata_extracted = true;
            checkpoint.save(&self.checkpoint_dir).await?;
            info!(doc_id = %checkpoint.doc_id, "Metadata extracted");
        }

        if checkpoint.document_id_db.is_none() {
            if let Some(metadata) = &checkpoint.metadata {
                let document = metadata.to_document()?;
                let document_id = document.id.clone();
                self.db.store_item(document).await?;
                checkpoint.document_id_db = Some(document_id);
                checkpoint.save(&self.checkpoint_dir).await?;
            }
        }

        if !checkpoint.text_extracted {
            let extracted = self.extract_text(&checkpoint.file_path).await?;
            let title = checkpoint
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.document_title.as_deref());
            let markdown = Self::to_markdown_document(&extracted.content, title);

            let text_path = checkpoint.text_artifact(&self.checkpoint_dir);
            tokio::fs::create_dir_all(&self.checkpoint_dir).await?;
            tokio::fs::write(&text_path, &markdown).await?;

            checkpoint.text_file = Some(text_path.to_string_lossy().into_owned());
            checkpoint.text_extracted = true;
            checkpoint.save(&self.checkpoint_dir).await?;
            info!(
                doc_id = %checkpoint.doc_id,
                pages = extracted.page_count,
                method = %extracted.extraction_method,
                "Text extracted"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_date_formats() {
        assert_eq!(normalize_date("2011-07-03").as_deref(), Some("2011-07-03"));
        assert_eq!(normalize_date("03/07/2011").as_deref(), Some("2011-07-03"));
        assert_eq!(normalize_date("03-07-2011").as_deref(), Some("2011-07-03"));
        assert_eq!(
            normalize_date("3 de julio de 2011").as_deref(),
            Some("2011-07-03")
        );
        assert_eq!(
            normalize_date("12 de Diciembre de 2024").as_deref(),
            Some("2024-12-12")
        );
    }

    #[test]
    fn unparseable_dates_return_none() {
        assert_eq!(normalize_date("fecha desconocida"), None);
        assert_eq!(normalize_date(""), None);
        assert_eq!(normalize_date("45 de enero de 2020"), None);
    }

    #[test]
    fn markdown_conversion_cleans_headers() {
        let text = "DIARIO OFICIAL\nDISPOSICIONES GENERALES\nArtículo 1.- El texto aplica.\nDIARIO OFICIAL";
        let markdown = DocumentExtractor::to_markdown_document(text, None);
        assert!(markdown.contains("## DISPOSICIONES GENERALES"));
        assert!(!markdown.contains("DIARIO OFICIAL"));
    }

    #[tokio::test]
    async fn plain_text_files_are_read_directly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("norma.txt");
        tokio::fs::write(&file, "Artículo 1.- Contenido.")
            .await
            .expect("write");

        let extractor = DocumentExtractor::new(
            Arc::new(LlmClient::from_config(
                &common::utils::config::AppConfig::default(),
            )),
            Arc::new(
                common::storage::db::SurrealDbClient::memory(
                    "test_ns",
                    &uuid::Uuid::new_v4().to_string(),
                )
                .await
                .expect("db"),
            ),
            dir.path().to_path_buf(),
        );

        let extracted = extractor
            .extract_text(&file.to_string_lossy())
            .await
            .expect("extract");
        assert_eq!(extracted.extraction_method, "plain_text");
        assert!(extracted.content.contains("Artículo 1"));
    }
}
