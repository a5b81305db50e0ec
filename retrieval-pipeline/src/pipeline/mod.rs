mod stages;

pub use stages::PipelineContext;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{
    error::AppError, storage::db::SurrealDbClient, utils::config::AppConfig,
    utils::llm::LlmClient,
};
use tracing::{info, instrument};

use crate::{
    query_analysis::QueryInfo,
    reranker::LlmReranker,
    RequestState, NO_RESULTS_MARKER,
};
use stages::{AssembleStage, EmbedStage, ExpandStage, RerankStage, VectorStage};

/// Per-search take for each cluster neighbourhood fetch.
const CLUSTER_TAKE: usize = 5;
/// Cap on lexical-search contributions to the merged set.
const BM25_TAKE: usize = 15;

/// Tunables for one retriever instance, resolved from the app config.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub corpus: String,
    pub max_chunks_returned: usize,
    pub cluster_take: usize,
    pub bm25_take: usize,
    pub max_chunks_for_reranking: usize,
    pub max_chunks_to_keep_normal: usize,
    pub max_chunks_to_keep_reports: usize,
    pub max_total_tokens: usize,
}

impl RetrievalConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            corpus: config.corpus.clone(),
            max_chunks_returned: config.max_chunks_returned,
            cluster_take: CLUSTER_TAKE,
            bm25_take: BM25_TAKE,
            max_chunks_for_reranking: config.max_chunks_for_reranking,
            max_chunks_to_keep_normal: config.max_chunks_to_keep_normal,
            max_chunks_to_keep_reports: config.max_chunks_to_keep_reports,
            max_total_tokens: config.max_total_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Embed,
    Vector,
    Expand,
    Rerank,
    Assemble,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }

    fn stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.as_millis())
            .unwrap_or(0)
    }
}

/// Hybrid retriever: vector, cluster, lexical and entity searches fanned out
/// over the corpus, merged, reranked and budgeted to a token limit.
pub struct HybridRetriever {
    db: Arc<SurrealDbClient>,
    llm: Arc<LlmClient>,
    reranker: Arc<LlmReranker>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        db: Arc<SurrealDbClient>,
        llm: Arc<LlmClient>,
        reranker: Arc<LlmReranker>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            llm,
            reranker,
            config,
        }
    }

    fn stages() -> Vec<BoxedStage> {
        vec![
            Box::new(EmbedStage),
            Box::new(VectorStage),
            Box::new(ExpandStage),
            Box::new(RerankStage),
            Box::new(AssembleStage),
        ]
    }

    /// Retrieves a token-budgeted context for `query`. Results are memoized
    /// in the per-request `state` under an 8-hex query fingerprint.
    #[instrument(skip_all, fields(query_chars = query.chars().count()))]
    pub async fn retrieve(
        &self,
        query: &str,
        query_info: Option<&QueryInfo>,
        state: &mut RequestState,
    ) -> Result<String, AppError> {
        self.retrieve_inner(query, query_info, None, state).await
    }

    /// Variant with a caller-supplied query embedding; used by tests and by
    /// callers that already embedded the search query.
    pub async fn retrieve_with_embedding(
        &self,
        query: &str,
        query_info: Option<&QueryInfo>,
        query_embedding: Vec<f32>,
        state: &mut RequestState,
    ) -> Result<String, AppError> {
        self.retrieve_inner(query, query_info, Some(query_embedding), state)
            .await
    }

    async fn retrieve_inner(
        &self,
        query: &str,
        query_info: Option<&QueryInfo>,
        query_embedding: Option<Vec<f32>>,
        state: &mut RequestState,
    ) -> Result<String, AppError> {
        let fingerprint = RequestState::fingerprint(query);
        if let Some(previous) = state.lookup(&fingerprint) {
            info!(%fingerprint, "Returning memoized retrieval result");
            return Ok(previous.clone());
        }

        let mut ctx = PipelineContext::new(
            &self.db,
            &self.llm,
            &self.reranker,
            &self.config,
            query.to_owned(),
            query_info,
        );
        ctx.query_embedding = query_embedding;

        let mut timings = PipelineStageTimings::default();
        for stage in Self::stages() {
            let start = Instant::now();
            stage.execute(&mut ctx).await?;
            timings.record(stage.kind(), start.elapsed());
        }

        info!(
            embed_ms = timings.stage_ms(StageKind::Embed) as u64,
            vector_ms = timings.stage_ms(StageKind::Vector) as u64,
            expand_ms = timings.stage_ms(StageKind::Expand) as u64,
            rerank_ms = timings.stage_ms(StageKind::Rerank) as u64,
            assemble_ms = timings.stage_ms(StageKind::Assemble) as u64,
            merged = ctx.merged.len(),
            "Retrieval pipeline finished"
        );

        let context = ctx
            .final_context
            .take()
            .unwrap_or_else(|| NO_RESULTS_MARKER.to_string());
        state.record(fingerprint, context.clone());
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::{ChunkMetadata, StoredChunk};
    use common::utils::config::AppConfig;
    use uuid::Uuid;

    use crate::query_analysis::{Entity, Keyword, QueryInfo};

    const TEST_CORPUS: &str = "pd_test";

    fn test_config() -> RetrievalConfig {
        let mut config = RetrievalConfig::from_app_config(&AppConfig::default());
        config.corpus = TEST_CORPUS.into();
        config
    }

    fn retriever(db: Arc<SurrealDbClient>) -> HybridRetriever {
        let llm = Arc::new(LlmClient::from_config(&AppConfig::default()));
        let reranker = Arc::new(LlmReranker::new(Arc::clone(&llm)));
        HybridRetriever::new(db, llm, reranker, test_config())
    }

    fn chunk(
        title: &str,
        content: &str,
        cluster_id: i64,
        status: Option<&str>,
        embedding: Vec<f32>,
    ) -> StoredChunk {
        let metadata = ChunkMetadata {
            chunk_size: content.len(),
            source: "test".into(),
            cluster_id,
            status: status.map(ToOwned::to_owned),
            ..ChunkMetadata::default()
        };
        StoredChunk::new(
            "/docs/test.pdf".into(),
            0,
            title.into(),
            "contexto del fragmento".into(),
            content.into(),
            metadata,
            embedding,
            None,
        )
    }

    async fn test_db() -> Arc<SurrealDbClient> {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized(TEST_CORPUS, 3).await.expect("indexes");
        Arc::new(db)
    }

    #[tokio::test]
    async fn zero_embedding_short_circuits_with_marker() {
        let db = test_db().await;
        let retriever = retriever(db);

        let mut state = RequestState::new();
        let context = retriever
            .retrieve_with_embedding("consulta", None, vec![0.0, 0.0, 0.0], &mut state)
            .await
            .expect("retrieval");

        assert_eq!(context, NO_RESULTS_MARKER);
    }

    #[tokio::test]
    async fn retrieves_vector_and_cluster_neighbours() {
        let db = test_db().await;

        chunk("vector hit", "contenido vectorial", 4, Some("vigente"), vec![1.0, 0.0, 0.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert");
        chunk("vecino", "vecino de cluster", 4, Some("vigente"), vec![0.0, 0.0, 1.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert");

        let retriever = retriever(Arc::clone(&db));
        let mut state = RequestState::new();
        let context = retriever
            .retrieve_with_embedding("contenido", None, vec![1.0, 0.0, 0.0], &mut state)
            .await
            .expect("retrieval");

        assert!(context.contains("vector hit"));
        assert!(context.contains("vecino"));
    }

    #[tokio::test]
    async fn memoizes_per_request_results() {
        let db = test_db().await;
        chunk("único", "texto", -1, None, vec![1.0, 0.0, 0.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert");

        let retriever = retriever(Arc::clone(&db));
        let mut state = RequestState::new();

        let first = retriever
            .retrieve_with_embedding("consulta", None, vec![1.0, 0.0, 0.0], &mut state)
            .await
            .expect("first retrieval");
        // Second call with a zero embedding would normally short-circuit,
        // but the memoized result must win.
        let second = retriever
            .retrieve_with_embedding("consulta", None, vec![0.0, 0.0, 0.0], &mut state)
            .await
            .expect("second retrieval");

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn entity_search_contributes_matches() {
        let db = test_db().await;

        chunk("vector", "texto base", -1, Some("vigente"), vec![1.0, 0.0, 0.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert");
        chunk(
            "Artículo 3 LFPDPPP",
            "La LFPDPPP regula los datos personales.",
            -1,
            Some("vigente"),
            vec![0.0, 1.0, 0.0],
        )
        .insert(TEST_CORPUS, &db)
        .await
        .expect("insert");

        let info = QueryInfo {
            original_query: "Qué dice la LFPDPPP".into(),
            entities: vec![Entity {
                text: "LFPDPPP".into(),
                entity_type: "regulation".into(),
            }],
            keywords: vec![Keyword {
                word: "lfpdppp".into(),
                importance: 0.9,
            }],
            ..QueryInfo::minimal("Qué dice la LFPDPPP")
        };

        let retriever = retriever(Arc::clone(&db));
        let mut state = RequestState::new();
        let context = retriever
            .retrieve_with_embedding(
                "Qué dice la LFPDPPP",
                Some(&info),
                vec![1.0, 0.0, 0.0],
                &mut state,
            )
            .await
            .expect("retrieval");

        assert!(context.contains("LFPDPPP"));
    }
}
