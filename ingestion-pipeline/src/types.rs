use chrono::Utc;
use common::{error::AppError, storage::types::document::RegulatoryDocument};
use serde::{Deserialize, Serialize};

/// Metadata extracted from a regulatory publication by the LLM pass.
/// Everything is optional; downstream consumers apply defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub document_title: Option<String>,
    #[serde(default)]
    pub issuing_authority: Option<String>,
    #[serde(default)]
    pub publication_date: Option<String>,
    #[serde(default)]
    pub effective_date: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub official_source: Option<String>,
    #[serde(default)]
    pub original_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub extraction_date: Option<String>,
    #[serde(default)]
    pub extraction_error: Option<String>,
}

impl DocumentMetadata {
    /// Minimal record used when metadata extraction failed outright.
    pub fn failed(path: &str, error: &str) -> Self {
        Self {
            document_type: Some("Desconocido".into()),
            original_url: Some(path.to_owned()),
            file_name: std::path::Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            extraction_date: Some(Utc::now().to_rfc3339()),
            extraction_error: Some(error.to_owned()),
            ..Self::default()
        }
    }

    /// Builds the storable document row, applying the documented defaults
    /// for missing type and title.
    pub fn to_document(&self) -> Result<RegulatoryDocument, AppError> {
        let extra = serde_json::json!({
            "file_name": self.file_name,
            "extraction_date": self.extraction_date,
            "extraction_error": self.extraction_error,
        });

        RegulatoryDocument::new(
            self.document_type
                .clone()
                .unwrap_or_else(|| "Desconocido".into()),
            self.document_title
                .clone()
                .unwrap_or_else(|| "Sin título".into()),
            self.issuing_authority.clone(),
            self.publication_date.clone(),
            self.effective_date.clone(),
            self.jurisdiction.clone(),
            self.status.clone(),
            self.document_number.clone(),
            self.official_source.clone(),
            self.original_url.clone(),
            extra,
        )
    }
}

/// Text extracted from one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedText {
    pub content: String,
    pub page_count: usize,
    pub extraction_method: String,
}

/// One hierarchy marker (`CAPÍTULO`, `TÍTULO`, `SECCIÓN`) covering an
/// article.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HierarchyEntry {
    #[serde(rename = "type")]
    pub level: String,
    pub number: String,
    pub title: String,
}

/// Raw split output: one chunk of document text plus the splitter-level
/// metadata the chunk processor enriches later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitChunk {
    pub text: String,
    pub cluster_id: i64,
    pub cluster_size: usize,
    #[serde(default)]
    pub has_overlap: bool,
    #[serde(default)]
    pub article_number: Option<String>,
    #[serde(default)]
    pub article_title: Option<String>,
    #[serde(default)]
    pub is_subdivision: bool,
    #[serde(default)]
    pub clustering_method: String,
    #[serde(default)]
    pub hierarchy: Vec<HierarchyEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_metadata_carries_error_and_defaults() {
        let metadata = DocumentMetadata::failed("/docs/ley.pdf", "timeout");
        assert_eq!(metadata.document_type.as_deref(), Some("Desconocido"));
        assert_eq!(metadata.file_name.as_deref(), Some("ley.pdf"));
        assert_eq!(metadata.extraction_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn to_document_defaults_missing_title() {
        let metadata = DocumentMetadata {
            document_type: Some("Ley".into()),
            ..DocumentMetadata::default()
        };
        let document = metadata.to_document().expect("document");
        assert_eq!(document.document_title, "Sin título");
        assert_eq!(document.document_type, "Ley");
    }
}
