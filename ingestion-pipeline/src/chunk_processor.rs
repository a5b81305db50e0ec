use std::{path::Path, sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    error::AppError,
    storage::types::chunk::{ChunkMetadata, ProcessedChunk},
    utils::llm::LlmClient,
};
use futures::future::join_all;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::{
    extractor::normalize_date,
    types::{DocumentMetadata, SplitChunk},
};

/// Characters of chunk body included in enrichment prompts.
const PROMPT_SAMPLE_CHARS: usize = 1000;
/// Pause between enrichment batches.
const BATCH_PAUSE: Duration = Duration::from_secs(2);

const TITLE_SUMMARY_SYSTEM: &str = "You are an AI that extracts titles and summaries from \
documentation chunks in the same language as the chunk. Return a JSON object with 'title' \
and 'summary' keys. For the title: extract its title. For the summary: give a short succinct \
context to situate this chunk within the overall document for the purposes of improving \
search retrieval of the chunk, and include any important cross-references to other provisions \
of the document. Answer only with the succinct context and nothing else. Keep both title and \
summary concise but informative.";

const CATEGORY_SYSTEM: &str = "Eres un modelo de IA que clasifica fragmentos de texto en \
categorías y subcategorías predefinidas.\n\
La clasificación se organiza así:\n\n\
Categoría: Sostenibilidad\n\
Subcategoría: ESG\nSubcategoría: SFDR\nSubcategoría: Green MIFID\n\
Subcategoría: Métricas e informes de sostenibilidad\n\
Subcategoría: Estrategias de inversión responsable\n\n\
Categoría: Riesgos Financieros\n\
Subcategoría: Riesgo de crédito\nSubcategoría: Riesgo de mercado\n\
Subcategoría: Riesgo de contraparte\nSubcategoría: Riesgo operacional\n\
Subcategoría: Gestión de riesgo de terceros\n\n\
Categoría: Regulación y Supervisión\n\
Subcategoría: PBC/FT (Prevención de Blanqueo de Capitales / Financiación del Terrorismo)\n\
Subcategoría: MiCA (Markets in Crypto-Assets)\nSubcategoría: Regulación IA\n\
Subcategoría: Supervisión bancaria\nSubcategoría: Protección del consumidor\n\n\
Categoría: Seguridad Financiera\n\
Subcategoría: Fraude\nSubcategoría: Know Your Customer (KYC)\n\
Subcategoría: Protección de datos\nSubcategoría: Ciberseguridad\n\
Subcategoría: Medios de pago\n\n\
Categoría: Reporting Regulatorio\n\
Subcategoría: FINREP/COREP\nSubcategoría: Reportes de liquidez\nSubcategoría: IFRS\n\
Subcategoría: Reporting de capital y solvencia\nSubcategoría: Reporting ESG\n\n\
Categoría: Tesorería\n\
Subcategoría: Gestión de liquidez\nSubcategoría: Instrumentos de financiación\n\
Subcategoría: Control de pagos y cobros\n\
Subcategoría: Cobertura de riesgos de tipo de interés y tipo de cambio\n\
Subcategoría: Gestión de activos y pasivos a corto plazo\n\n\
A partir de esta lista, clasifica cada fragmento de texto en exactamente una categoría y \
una subcategoría (la que consideres más relevante).";

const KEYWORDS_SYSTEM: &str = "Eres un modelo de IA que extrae palabras clave de fragmentos \
de texto. Para cada fragmento identifica el tipo de documento regulatorio y devuelve dos \
palabras clave que representan los temas principales del contenido.";

#[derive(Debug, Deserialize)]
struct TitleSummary {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
}

/// Enriches raw split chunks with titles, summaries, classification,
/// keywords and a context-enriched embedding, in rate-friendly batches.
pub struct ChunkProcessor {
    llm: Arc<LlmClient>,
    batch_size: usize,
}

impl ChunkProcessor {
    pub fn new(llm: Arc<LlmClient>, batch_size: usize) -> Self {
        Self {
            llm,
            batch_size: batch_size.max(1),
        }
    }

    #[instrument(skip_all, fields(chunks = chunks.len(), identifier))]
    pub async fn process_chunks(
        &self,
        chunks: &[SplitChunk],
        identifier: &str,
        document_id: Option<&str>,
        document_metadata: Option<&DocumentMetadata>,
    ) -> Result<Vec<ProcessedChunk>, AppError> {
        let mut processed = Vec::with_capacity(chunks.len());

        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            info!(
                batch = batch_index + 1,
                total_batches = chunks.len().div_ceil(self.batch_size),
                "Processing chunk batch"
            );

            let offset = batch_index * self.batch_size;
            let results = join_all(batch.iter().enumerate().map(|(index, chunk)| {
                self.process_single(
                    chunk,
                    (offset + index) as i64,
                    identifier,
                    document_id,
                    document_metadata,
                )
            }))
            .await;
            processed.extend(results);

            if offset + batch.len() < chunks.len() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        Ok(processed)
    }

    async fn process_single(
        &self,
        chunk: &SplitChunk,
        chunk_number: i64,
        identifier: &str,
        document_id: Option<&str>,
        document_metadata: Option<&DocumentMetadata>,
    ) -> ProcessedChunk {
        let extracted = self.title_and_summary(&chunk.text, identifier).await;

        let embedding_input = build_enriched_embedding_input(
            &chunk.text,
            &extracted.summary,
            document_metadata,
            chunk.article_number.as_deref(),
            chunk.article_title.as_deref(),
        );
        let embedding = self.llm.embed_or_zero(&embedding_input).await;

        let category = self.categorize(&chunk.text).await;
        let keywords = self.extract_keywords(&chunk.text).await;

        let date = date_from_identifier(identifier);
        let source = source_for(identifier);

        let metadata = ChunkMetadata {
            chunk_size: chunk.text.chars().count(),
            source,
            date,
            category,
            keywords,
            cluster_id: chunk.cluster_id,
            cluster_size: chunk.cluster_size,
            article_number: chunk.article_number.clone(),
            article_title: chunk.article_title.clone(),
            document_type: document_metadata.and_then(|m| m.document_type.clone()),
            document_title: document_metadata.and_then(|m| m.document_title.clone()),
            issuing_authority: document_metadata.and_then(|m| m.issuing_authority.clone()),
            publication_date: document_metadata.and_then(|m| m.publication_date.clone()),
            jurisdiction: document_metadata.and_then(|m| m.jurisdiction.clone()),
            status: document_metadata.and_then(|m| m.status.clone()),
            document_number: document_metadata.and_then(|m| m.document_number.clone()),
            official_source: document_metadata.and_then(|m| m.official_source.clone()),
            embedding_type: "enriched_with_context".into(),
            has_overlap: chunk.has_overlap,
            clustering_method: chunk.clustering_method.clone(),
            is_subdivision: chunk.is_subdivision,
        };

        ProcessedChunk {
            url: identifier.to_owned(),
            chunk_number,
            title: extracted.title,
            summary: extracted.summary,
            content: chunk.text.clone(),
            metadata,
            embedding,
            document_id: document_id.map(ToOwned::to_owned),
        }
    }

    async fn title_and_summary(&self, chunk_text: &str, identifier: &str) -> TitleSummary {
        let sample: String = chunk_text.chars().take(PROMPT_SAMPLE_CHARS).collect();
        let user = format!("Identifier: {identifier}\n\nContent:\n{sample}...");

        match self
            .llm
            .chat_json::<TitleSummary>(&self.llm.llm_model, TITLE_SUMMARY_SYSTEM, &user)
            .await
        {
            Ok(extracted) => extracted,
            Err(err) => {
                warn!(error = %err, "Title/summary extraction failed");
                TitleSummary {
                    title: "Error procesando el título".into(),
                    summary: "Error procesando el resumen".into(),
                }
            }
        }
    }

    async fn categorize(&self, chunk_text: &str) -> String {
        let sample: String = chunk_text.chars().take(PROMPT_SAMPLE_CHARS).collect();
        match self
            .llm
            .chat_text(
                &self.llm.llm_model,
                CATEGORY_SYSTEM,
                &format!("Content:\n{sample}..."),
            )
            .await
        {
            Ok(category) => category.trim().to_owned(),
            Err(err) => {
                warn!(error = %err, "Category classification failed");
                "Otros".into()
            }
        }
    }

    async fn extract_keywords(&self, chunk_text: &str) -> String {
        let sample: String = chunk_text.chars().take(PROMPT_SAMPLE_CHARS).collect();
        match self
            .llm
            .chat_text(
                &self.llm.llm_model,
                KEYWORDS_SYSTEM,
                &format!("Content:\n{sample}..."),
            )
            .await
        {
            Ok(keywords) => keywords.trim().to_owned(),
            Err(err) => {
                warn!(error = %err, "Keyword extraction failed");
                "Otros".into()
            }
        }
    }
}

/// Embedding input with situating context ahead of the chunk body: article
/// marker, summary and replicated document fields, one per line.
pub fn build_enriched_embedding_input(
    chunk_text: &str,
    summary: &str,
    document_metadata: Option<&DocumentMetadata>,
    article_number: Option<&str>,
    article_title: Option<&str>,
) -> String {
    let mut components = Vec::new();

    if let Some(number) = article_number {
        components.push(format!("Artículo: {number}"));
    }
    if let Some(title) = article_title {
        components.push(format!("Título del artículo: {title}"));
    }
    if !summary.trim().is_empty() {
        components.push(format!("Contexto del fragmento: {summary}"));
    }

    if let Some(metadata) = document_metadata {
        if let Some(document_type) = &metadata.document_type {
            components.push(format!("Tipo de documento: {document_type}"));
        }
        if let Some(authority) = &metadata.issuing_authority {
            components.push(format!("Autoridad emisora: {authority}"));
        }
        if let Some(title) = &metadata.document_title {
            components.push(format!("Documento: {title}"));
        }
        if let Some(jurisdiction) = &metadata.jurisdiction {
            components.push(format!("Jurisdicción: {jurisdiction}"));
        }
    }

    format!(
        "{}\n\nContenido del fragmento:\n{chunk_text}",
        components.join("\n")
    )
}

/// Date derived from the identifier's path segments, falling back to now.
pub fn date_from_identifier(identifier: &str) -> String {
    let path = identifier
        .split("://")
        .nth(1)
        .unwrap_or(identifier);

    for segment in path.split(['/', '\\']) {
        if let Some(date) = normalize_date(segment) {
            return date;
        }
    }

    Utc::now().to_rfc3339()
}

/// Registered domain for URLs, file basename otherwise.
pub fn source_for(identifier: &str) -> String {
    if identifier.starts_with("http") {
        if let Ok(parsed) = url::Url::parse(identifier) {
            if let Some(host) = parsed.host_str() {
                let labels: Vec<&str> = host.split('.').collect();
                if labels.len() >= 2 {
                    return labels[labels.len() - 2..].join(".");
                }
                return host.to_owned();
            }
        }
    }

    Path::new(identifier)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fuente_desconocida".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enriched_input_orders_context_before_body() {
        let metadata = DocumentMetadata {
            document_type: Some("Ley".into()),
            document_title: Some("Ley 29733".into()),
            issuing_authority: Some("Congreso".into()),
            jurisdiction: Some("Perú".into()),
            ..DocumentMetadata::default()
        };

        let input = build_enriched_embedding_input(
            "cuerpo del fragmento",
            "contexto situacional",
            Some(&metadata),
            Some("3"),
            Some("Artículo 3.- Definiciones"),
        );

        let lines: Vec<&str> = input.lines().collect();
        assert_eq!(lines[0], "Artículo: 3");
        assert_eq!(lines[1], "Título del artículo: Artículo 3.- Definiciones");
        assert_eq!(lines[2], "Contexto del fragmento: contexto situacional");
        assert_eq!(lines[3], "Tipo de documento: Ley");
        assert_eq!(lines[4], "Autoridad emisora: Congreso");
        assert_eq!(lines[5], "Documento: Ley 29733");
        assert_eq!(lines[6], "Jurisdicción: Perú");
        assert!(input.ends_with("Contenido del fragmento:\ncuerpo del fragmento"));
    }

    #[test]
    fn enriched_input_skips_unset_fields() {
        let input =
            build_enriched_embedding_input("cuerpo", "resumen", None, None, None);
        assert!(input.starts_with("Contexto del fragmento: resumen"));
        assert!(!input.contains("Artículo:"));
        assert!(!input.contains("Tipo de documento:"));
    }

    #[test]
    fn date_extracted_from_path_segment() {
        assert_eq!(
            date_from_identifier("https://example.com/normas/2024-03-15/ley.pdf"),
            "2024-03-15"
        );
        // No parseable segment: falls back to a timestamp.
        let fallback = date_from_identifier("/docs/ley.pdf");
        assert!(fallback.contains('T'));
    }

    #[test]
    fn source_is_registered_domain_for_urls() {
        assert_eq!(
            source_for("https://www.gob.pe/normas/ley.pdf"),
            "gob.pe"
        );
        assert_eq!(source_for("/docs/uploads/ley_29733.pdf"), "ley_29733.pdf");
    }
}
