use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::{ChunkHit, StoredChunk},
            document::RegulatoryDocument,
        },
    },
    utils::{
        embedding::is_zero_embedding,
        llm::LlmClient,
        tokens::{count_tokens, truncate_to_tokens},
    },
};
use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{debug, instrument, warn};

use crate::{
    bm25::{tokenize, Bm25Index},
    query_analysis::{Complexity, QueryInfo},
    reranker::{LlmReranker, RerankOptions},
};

use super::{PipelineStage, RetrievalConfig, StageKind};

/// Entity types eligible for the substring search fan-out.
const ENTITY_SEARCH_TYPES: &[&str] =
    &["regulation", "program", "process", "technical_requirement"];

/// Query markers that select the larger report-oriented rerank target.
const REPORT_KEYWORDS: &[&str] = &[
    "reporte",
    "informe",
    "análisis detallado",
    "documento",
    "generar reporte",
    "crear informe",
    "análisis completo",
];

/// Keyword importance above which query keywords replace the raw query as
/// the lexical search terms.
const KEYWORD_IMPORTANCE_CUTOFF: f32 = 0.7;

const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

pub struct PipelineContext<'a> {
    pub db: &'a SurrealDbClient,
    pub llm: &'a LlmClient,
    pub reranker: &'a LlmReranker,
    pub config: &'a RetrievalConfig,
    pub query: String,
    pub query_info: Option<&'a QueryInfo>,
    pub search_query: String,
    pub query_embedding: Option<Vec<f32>>,
    pub aborted: bool,
    pub vector_hits: Vec<ChunkHit>,
    pub merged: Vec<StoredChunk>,
    pub ranked: Vec<String>,
    pub final_context: Option<String>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        db: &'a SurrealDbClient,
        llm: &'a LlmClient,
        reranker: &'a LlmReranker,
        config: &'a RetrievalConfig,
        query: String,
        query_info: Option<&'a QueryInfo>,
    ) -> Self {
        Self {
            db,
            llm,
            reranker,
            config,
            search_query: query.clone(),
            query,
            query_info,
            query_embedding: None,
            aborted: false,
            vector_hits: Vec::new(),
            merged: Vec::new(),
            ranked: Vec::new(),
            final_context: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EmbedStage;

#[async_trait]
impl PipelineStage for EmbedStage {
    fn kind(&self) -> StageKind {
        StageKind::Embed
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        ctx.search_query = select_search_query(&ctx.query, ctx.query_info);

        if ctx.query_embedding.is_none() {
            debug!("Embedding search query for hybrid retrieval");
            let embedding = ctx.llm.embed_or_zero(&ctx.search_query).await;
            ctx.query_embedding = Some(embedding);
        }

        if ctx
            .query_embedding
            .as_deref()
            .map(is_zero_embedding)
            .unwrap_or(true)
        {
            warn!("Query embedding is the zero sentinel; aborting retrieval");
            ctx.aborted = true;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VectorStage;

#[async_trait]
impl PipelineStage for VectorStage {
    fn kind(&self) -> StageKind {
        StageKind::Vector
    }

    #[instrument(level = "trace", skip_all)]
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        if ctx.aborted {
            return Ok(());
        }

        let Some(embedding) = ctx.query_embedding.clone() else {
            return Ok(());
        };

        match StoredChunk::vector_match(
            &ctx.config.corpus,
            embedding,
            ctx.config.max_chunks_returned,
            ctx.db,
        )
        .await
        {
            Ok(hits) => {
                debug!(hits = hits.len(), "Vector search complete");
                ctx.vector_hits = hits;
            }
            Err(err) => {
                warn!(error = %err, "Vector search failed; contributing no seeds");
            }
        }

        Ok(())
    }
}

/// Runs the three secondary searches concurrently (cluster, lexical and
/// entity), then merges all four result groups in the fixed order
/// `vector ‖ cluster ‖ bm25 ‖ entity` with id-level dedup.
#[derive(Debug, Clone, Copy)]
pub struct ExpandStage;

#[async_trait]
impl PipelineStage for ExpandStage {
    fn kind(&self) -> StageKind {
        StageKind::Expand
    }

    #[instrument(level = "trace", skip_all)]
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        if ctx.aborted {
            return Ok(());
        }

        let matched: HashSet<String> = ctx
            .vector_hits
            .iter()
            .map(|hit| hit.chunk.id.clone())
            .collect();
        let cluster_ids: HashSet<i64> = ctx
            .vector_hits
            .iter()
            .map(|hit| hit.chunk.metadata.cluster_id)
            .filter(|cluster_id| *cluster_id >= 0)
            .collect();

        let db = ctx.db;
        let config = ctx.config;
        let search_query = ctx.search_query.clone();
        let query_info = ctx.query_info;

        let cluster_future = async {
            match cluster_search(db, config, &cluster_ids, &matched).await {
                Ok(chunks) => chunks,
                Err(err) => {
                    warn!(error = %err, "Cluster search failed; contributing nothing");
                    Vec::new()
                }
            }
        };
        let bm25_future = async {
            match lexical_search(db, config, &search_query, query_info, &matched).await {
                Ok(chunks) => chunks,
                Err(err) => {
                    warn!(error = %err, "Lexical search failed; contributing nothing");
                    Vec::new()
                }
            }
        };
        let entity_future = async {
            match entity_search(db, config, query_info, &matched).await {
                Ok(chunks) => chunks,
                Err(err) => {
                    warn!(error = %err, "Entity search failed; contributing nothing");
                    Vec::new()
                }
            }
        };

        let (cluster_hits, bm25_hits, entity_hits) =
            tokio::join!(cluster_future, bm25_future, entity_future);

        debug!(
            vector = ctx.vector_hits.len(),
            cluster = cluster_hits.len(),
            bm25 = bm25_hits.len(),
            entity = entity_hits.len(),
            "Fan-out searches complete"
        );

        let vector_chunks: Vec<StoredChunk> = ctx
            .vector_hits
            .iter()
            .map(|hit| hit.chunk.clone())
            .collect();
        ctx.merged = merge_groups(vec![vector_chunks, cluster_hits, bm25_hits, entity_hits]);

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    #[instrument(level = "trace", skip_all)]
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        if ctx.aborted || ctx.merged.is_empty() {
            return Ok(());
        }

        let formatted: Vec<String> = ctx.merged.iter().map(format_chunk).collect();

        if formatted.len() < 4 {
            debug!(
                candidates = formatted.len(),
                "Too few candidates; skipping rerank"
            );
            ctx.ranked = formatted;
            return Ok(());
        }

        let target = rerank_target(&ctx.query, ctx.query_info, ctx.config);
        debug!(target, candidates = formatted.len(), "Reranking merged candidates");

        let ranked = ctx
            .reranker
            .rerank(
                &ctx.query,
                formatted,
                RerankOptions {
                    max_to_rerank: ctx.config.max_chunks_for_reranking,
                    max_to_return: target,
                    diversify: true,
                },
            )
            .await;
        ctx.ranked = ranked;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssembleStage;

#[async_trait]
impl PipelineStage for AssembleStage {
    fn kind(&self) -> StageKind {
        StageKind::Assemble
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        if ctx.aborted || ctx.ranked.is_empty() {
            ctx.final_context = None;
            return Ok(());
        }

        let header = ctx.query_info.and_then(build_context_header);
        let header_tokens = header.as_deref().map(count_tokens).unwrap_or(0);
        let budget = ctx.config.max_total_tokens.saturating_sub(header_tokens);

        let kept = budget_chunks(&ctx.ranked, budget);
        debug!(
            kept = kept.len(),
            dropped = ctx.ranked.len().saturating_sub(kept.len()),
            "Token budget applied"
        );

        let body = kept.join(CHUNK_SEPARATOR);
        ctx.final_context = Some(match header {
            Some(header) => format!("{header}{body}"),
            None => body,
        });

        Ok(())
    }
}

/// Step 2 of the retrieve contract: prefer the optimized search query, then
/// the expanded query, then the raw input.
fn select_search_query(query: &str, query_info: Option<&QueryInfo>) -> String {
    if let Some(info) = query_info {
        if !info.search_query.trim().is_empty() {
            return info.search_query.clone();
        }
        if !info.expanded_query.trim().is_empty() {
            return info.expanded_query.clone();
        }
    }
    query.to_owned()
}

async fn cluster_search(
    db: &SurrealDbClient,
    config: &RetrievalConfig,
    cluster_ids: &HashSet<i64>,
    matched: &HashSet<String>,
) -> Result<Vec<StoredChunk>, AppError> {
    if cluster_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut futures = FuturesUnordered::new();
    for cluster_id in cluster_ids {
        let corpus = config.corpus.clone();
        let take = config.cluster_take;
        let cluster_id = *cluster_id;
        futures
            .push(async move { StoredChunk::cluster_match(&corpus, cluster_id, take, db).await });
    }

    let mut seen = HashSet::new();
    let mut results = Vec::new();
    while let Some(outcome) = futures.next().await {
        for chunk in outcome? {
            if matched.contains(&chunk.id) || !seen.insert(chunk.id.clone()) {
                continue;
            }
            results.push(chunk);
        }
    }

    Ok(results)
}

/// Scans the vigente-filtered corpus, builds an in-process BM25 index over
/// the batch and returns the best unmatched chunks.
async fn lexical_search(
    db: &SurrealDbClient,
    config: &RetrievalConfig,
    search_query: &str,
    query_info: Option<&QueryInfo>,
    matched: &HashSet<String>,
) -> Result<Vec<StoredChunk>, AppError> {
    let rows = StoredChunk::scan_all(&config.corpus, db).await?;

    let document_ids: Vec<String> = rows
        .iter()
        .filter_map(|chunk| chunk.document_id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let statuses = RegulatoryDocument::statuses_by_id(&document_ids, db).await?;

    let candidates: Vec<StoredChunk> = rows
        .into_iter()
        .filter(|chunk| is_vigente(chunk, &statuses))
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let corpus_tokens: Vec<Vec<String>> = candidates
        .iter()
        .map(|chunk| {
            let metadata_text =
                serde_json::to_string(&chunk.metadata).unwrap_or_default();
            tokenize(&format!(
                "{} {} {} {metadata_text}",
                chunk.title, chunk.summary, chunk.content
            ))
        })
        .collect();
    let index = Bm25Index::new(&corpus_tokens);

    let query_tokens = lexical_query_tokens(search_query, query_info);
    let ranked = index.top_indices(&query_tokens, candidates.len());

    let mut results = Vec::new();
    for index in ranked {
        if results.len() >= config.bm25_take {
            break;
        }
        let chunk = &candidates[index];
        if matched.contains(&chunk.id) {
            continue;
        }
        results.push(chunk.clone());
    }

    Ok(results)
}

/// High-importance analyzer keywords replace the raw query terms when any
/// are present.
fn lexical_query_tokens(search_query: &str, query_info: Option<&QueryInfo>) -> Vec<String> {
    if let Some(info) = query_info {
        let important: Vec<&str> = info
            .keywords
            .iter()
            .filter(|keyword| keyword.importance > KEYWORD_IMPORTANCE_CUTOFF)
            .map(|keyword| keyword.word.as_str())
            .collect();
        if !important.is_empty() {
            return tokenize(&important.join(" "));
        }
    }
    tokenize(search_query)
}

async fn entity_search(
    db: &SurrealDbClient,
    config: &RetrievalConfig,
    query_info: Option<&QueryInfo>,
    matched: &HashSet<String>,
) -> Result<Vec<StoredChunk>, AppError> {
    let Some(info) = query_info else {
        return Ok(Vec::new());
    };

    let needles: Vec<String> = info
        .entities
        .iter()
        .filter(|entity| ENTITY_SEARCH_TYPES.contains(&entity.entity_type.as_str()))
        .map(|entity| entity.text.to_lowercase())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    if needles.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen = HashSet::new();
    let mut results = Vec::new();
    for needle in needles {
        let chunks = StoredChunk::filter_by_substring(&config.corpus, &needle, db).await?;
        for chunk in chunks {
            if matched.contains(&chunk.id) || !seen.insert(chunk.id.clone()) {
                continue;
            }
            results.push(chunk);
        }
    }

    Ok(results)
}

/// The vigente predicate for lexical search: the parent document's status
/// wins when present; chunks without a parent fall back to their own
/// replicated status; absent status on both sides means included.
fn is_vigente(
    chunk: &StoredChunk,
    statuses: &HashMap<String, Option<String>>,
) -> bool {
    let document_status = chunk
        .document_id
        .as_ref()
        .and_then(|document_id| statuses.get(document_id));

    match document_status {
        Some(Some(status)) => status == "vigente",
        Some(None) => chunk.metadata.status.is_none(),
        None => match &chunk.metadata.status {
            Some(status) => status == "vigente",
            None => true,
        },
    }
}

/// Concatenates the result groups in contract order, deduplicating by id
/// while preserving within-group order.
fn merge_groups(groups: Vec<Vec<StoredChunk>>) -> Vec<StoredChunk> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for group in groups {
        for chunk in group {
            if seen.insert(chunk.id.clone()) {
                merged.push(chunk);
            }
        }
    }
    merged
}

/// Display form of a chunk inside the LLM context window.
fn format_chunk(chunk: &StoredChunk) -> String {
    let mut header = format!("# {}", chunk.title);
    if let Some(article) = &chunk.metadata.article_number {
        header.push_str(&format!(" [Artículo {article}]"));
    }
    if let Some(document_title) = &chunk.metadata.document_title {
        header.push_str(&format!("\nDocumento: {document_title}"));
    }
    format!("{header}\n\n{}\n\n{}", chunk.summary, chunk.content)
}

/// Report-style requests and complex queries get the larger rerank target.
fn rerank_target(
    query: &str,
    query_info: Option<&QueryInfo>,
    config: &RetrievalConfig,
) -> usize {
    let lowered = query.to_lowercase();
    let wants_report = REPORT_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
        || query_info
            .map(|info| info.complexity == Complexity::Complex)
            .unwrap_or(false);

    if wants_report {
        config.max_chunks_to_keep_reports
    } else {
        config.max_chunks_to_keep_normal
    }
}

/// Drops chunks from the tail until the joined context fits the budget,
/// allowing the last included chunk to be truncated. At least one (possibly
/// truncated) chunk survives whenever the input is non-empty.
fn budget_chunks(chunks: &[String], max_tokens: usize) -> Vec<String> {
    let separator_tokens = count_tokens(CHUNK_SEPARATOR);
    let mut kept = Vec::new();
    let mut used = 0usize;

    for (position, chunk) in chunks.iter().enumerate() {
        let separator_cost = if position == 0 { 0 } else { separator_tokens };
        let chunk_tokens = count_tokens(chunk);

        if used + separator_cost + chunk_tokens <= max_tokens {
            kept.push(chunk.clone());
            used += separator_cost + chunk_tokens;
            continue;
        }

        let remaining = max_tokens.saturating_sub(used + separator_cost);
        if remaining > 0 {
            kept.push(truncate_to_tokens(chunk, remaining));
        }
        break;
    }

    kept
}

fn build_context_header(info: &QueryInfo) -> Option<String> {
    let mut lines = Vec::new();

    if let Some(intent) = info.intents.first() {
        lines.push(format!("Intención detectada: {}", intent.name));
    }
    if !info.entities.is_empty() {
        let names: Vec<&str> = info
            .entities
            .iter()
            .map(|entity| entity.text.as_str())
            .collect();
        lines.push(format!("Entidades: {}", names.join(", ")));
    }

    if lines.is_empty() {
        None
    } else {
        Some(format!("{}\n\n", lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::ChunkMetadata;

    fn chunk_with_status(
        id: &str,
        document_id: Option<&str>,
        status: Option<&str>,
    ) -> StoredChunk {
        let mut chunk = StoredChunk::new(
            "/doc".into(),
            0,
            "título".into(),
            "resumen".into(),
            "contenido".into(),
            ChunkMetadata {
                status: status.map(ToOwned::to_owned),
                ..ChunkMetadata::default()
            },
            vec![0.1],
            document_id.map(ToOwned::to_owned),
        );
        chunk.id = id.into();
        chunk
    }

    #[test]
    fn vigente_uses_document_status_when_present() {
        let mut statuses = HashMap::new();
        statuses.insert("doc1".to_string(), Some("vigente".to_string()));
        statuses.insert("doc2".to_string(), Some("derogado".to_string()));

        assert!(is_vigente(
            &chunk_with_status("a", Some("doc1"), Some("derogado")),
            &statuses
        ));
        assert!(!is_vigente(
            &chunk_with_status("b", Some("doc2"), Some("vigente")),
            &statuses
        ));
    }

    #[test]
    fn vigente_falls_back_to_chunk_status_without_document() {
        let statuses = HashMap::new();
        assert!(is_vigente(
            &chunk_with_status("a", None, Some("vigente")),
            &statuses
        ));
        assert!(!is_vigente(
            &chunk_with_status("b", None, Some("derogado")),
            &statuses
        ));
        assert!(is_vigente(&chunk_with_status("c", None, None), &statuses));
        // Parent referenced but never loaded: chunk-level status decides.
        assert!(is_vigente(
            &chunk_with_status("d", Some("ghost"), Some("vigente")),
            &statuses
        ));
    }

    #[test]
    fn merge_preserves_group_order_and_dedups() {
        let a = chunk_with_status("a", None, None);
        let b = chunk_with_status("b", None, None);
        let c = chunk_with_status("c", None, None);
        let duplicate_b = chunk_with_status("b", None, None);

        let merged = merge_groups(vec![
            vec![a.clone(), b.clone()],
            vec![duplicate_b, c.clone()],
        ]);

        let ids: Vec<&str> = merged.iter().map(|chunk| chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn report_queries_use_report_target() {
        let config = RetrievalConfig {
            corpus: "c".into(),
            max_chunks_returned: 30,
            cluster_take: 5,
            bm25_take: 15,
            max_chunks_for_reranking: 15,
            max_chunks_to_keep_normal: 8,
            max_chunks_to_keep_reports: 12,
            max_total_tokens: 1000,
        };

        assert_eq!(
            rerank_target("Genera un reporte normativo sobre la Ley X", None, &config),
            12
        );
        assert_eq!(rerank_target("¿Qué es el GDPR?", None, &config), 8);

        let complex = QueryInfo {
            complexity: Complexity::Complex,
            ..QueryInfo::minimal("q")
        };
        assert_eq!(rerank_target("q", Some(&complex), &config), 12);
    }

    #[test]
    fn budget_truncates_tail_chunk() {
        let chunks = vec!["uno dos tres cuatro cinco".to_string(); 4];
        let per_chunk = count_tokens(&chunks[0]);
        // Room for two full chunks plus part of the third.
        let budget = per_chunk * 2 + count_tokens(CHUNK_SEPARATOR) * 2 + per_chunk / 2;

        let kept = budget_chunks(&chunks, budget);
        assert!(kept.len() >= 2 && kept.len() <= 3);

        let joined = kept.join(CHUNK_SEPARATOR);
        assert!(count_tokens(&joined) <= budget);
    }

    #[test]
    fn budget_never_drops_everything() {
        let chunks = vec!["palabra ".repeat(200)];
        let kept = budget_chunks(&chunks, 10);
        assert_eq!(kept.len(), 1);
        assert!(count_tokens(&kept[0]) <= 10);
    }

    #[test]
    fn search_query_selection_prefers_optimized_query() {
        let info = QueryInfo {
            search_query: "optimizada".into(),
            expanded_query: "expandida".into(),
            ..QueryInfo::minimal("cruda")
        };
        assert_eq!(select_search_query("cruda", Some(&info)), "optimizada");

        let expanded_only = QueryInfo {
            search_query: String::new(),
            expanded_query: "expandida".into(),
            ..QueryInfo::minimal("cruda")
        };
        assert_eq!(
            select_search_query("cruda", Some(&expanded_only)),
            "expandida"
        );
        assert_eq!(select_search_query("cruda", None), "cruda");
    }

    #[test]
    fn lexical_tokens_prefer_important_keywords() {
        let info = QueryInfo {
            keywords: vec![
                crate::query_analysis::Keyword {
                    word: "lfpdppp".into(),
                    importance: 0.9,
                },
                crate::query_analysis::Keyword {
                    word: "ruido".into(),
                    importance: 0.2,
                },
            ],
            ..QueryInfo::minimal("consulta original")
        };

        let tokens = lexical_query_tokens("consulta original", Some(&info));
        assert_eq!(tokens, vec!["lfpdppp".to_string()]);

        let tokens = lexical_query_tokens("consulta original", None);
        assert_eq!(tokens, vec!["consulta".to_string(), "original".to_string()]);
    }

    #[test]
    fn formatted_chunk_carries_article_marker() {
        let mut chunk = chunk_with_status("a", None, None);
        chunk.metadata.article_number = Some("3".into());
        let formatted = format_chunk(&chunk);
        assert!(formatted.contains("[Artículo 3]"));
        assert!(formatted.starts_with("# título"));
    }

    #[test]
    fn header_built_from_intents_and_entities() {
        let info = QueryInfo {
            intents: vec![crate::query_analysis::Intent {
                name: "busqueda_articulo".into(),
                confidence: 0.9,
            }],
            entities: vec![crate::query_analysis::Entity {
                text: "LFPDPPP".into(),
                entity_type: "regulation".into(),
            }],
            ..QueryInfo::minimal("q")
        };

        let header = build_context_header(&info).expect("header");
        assert!(header.contains("busqueda_articulo"));
        assert!(header.contains("LFPDPPP"));

        assert!(build_context_header(&QueryInfo::minimal("q")).is_none());
    }
}
