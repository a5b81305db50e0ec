pub mod weights;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    utils::{embedding::cosine_similarity, llm::parse_llm_json, llm::LlmClient},
};
use futures::future::join_all;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::bm25::{tokenize, Bm25Index};
use weights::{adjust_weights, smart_normalize, SignalWeights};

const CACHE_TTL: Duration = Duration::from_secs(3600);
const CACHE_CAPACITY: usize = 100;
/// Chunks longer than this are replaced by a representative segment before
/// LLM evaluation to cap token cost.
const EVAL_MAX_CHARS: usize = 800;
/// Cosine similarity above which two chunks are considered near-duplicates
/// during diversification.
const SIMILARITY_THRESHOLD: f32 = 0.8;
const EMBED_MAX_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct RerankOptions {
    pub max_to_rerank: usize,
    pub max_to_return: usize,
    pub diversify: bool,
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self {
            max_to_rerank: 15,
            max_to_return: 8,
            diversify: true,
        }
    }
}

/// Time-aware LRU cache for rerank results.
struct TtlCache {
    entries: HashMap<String, (Vec<String>, Instant)>,
}

impl TtlCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn cleanup(&mut self) {
        self.entries
            .retain(|_, (_, stamp)| stamp.elapsed() < CACHE_TTL);
    }

    fn get(&mut self, key: &str) -> Option<Vec<String>> {
        self.cleanup();
        if let Some((value, stamp)) = self.entries.get_mut(key) {
            *stamp = Instant::now();
            return Some(value.clone());
        }
        None
    }

    fn insert(&mut self, key: String, value: Vec<String>) {
        self.cleanup();
        if self.entries.len() >= CACHE_CAPACITY {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, (value, Instant::now()));
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawEvaluation {
    #[serde(default)]
    pertenencia: f32,
    #[serde(default)]
    aplicabilidad: f32,
    #[serde(default)]
    completitud: f32,
    #[serde(default)]
    jerarquia: f32,
    #[serde(default)]
    referencias: f32,
    #[serde(default)]
    global: f32,
}

impl RawEvaluation {
    fn weighted_global(&self) -> f32 {
        0.35 * self.pertenencia
            + 0.25 * self.aplicabilidad
            + 0.15 * self.completitud
            + 0.15 * self.jerarquia
            + 0.10 * self.referencias
    }
}

const EVAL_SYSTEM: &str = "Eres un experto en análisis de documentos normativos. \
Evalúa la relevancia del fragmento respecto a la consulta con cinco criterios, \
cada uno de 0 a 10: pertenencia temática, aplicabilidad directa, completitud \
normativa, jerarquía normativa (Constitución=10, Ley=8-9, Reglamento=6-7, \
Resolución=4-5, Circular=1-3) y referencias cruzadas útiles. Calcula el puntaje \
global como 0.35*pertenencia + 0.25*aplicabilidad + 0.15*completitud + \
0.15*jerarquia + 0.10*referencias. Responde ÚNICAMENTE un objeto JSON: \
{\"pertenencia\": n, \"aplicabilidad\": n, \"completitud\": n, \"jerarquia\": n, \
\"referencias\": n, \"global\": n}.";

const SIMPLE_RERANK_SYSTEM: &str = "Puntúa de 0 a 10 la relevancia del fragmento \
para responder la consulta. Responde únicamente con el número.";

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\b(\d+(?:\.\d+)?)\b").unwrap()
    })
}

/// Extracts the first number in free-form scorer output.
fn extract_score(text: &str) -> Option<f32> {
    number_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
}

fn char_slice(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end.saturating_sub(start)).collect()
}

/// Representative segment of a long chunk: title plus the first, middle and
/// last thirds of the evaluation budget.
fn representative_segment(chunk: &str, max_chars: usize) -> String {
    let char_count = chunk.chars().count();
    if char_count <= max_chars {
        return chunk.to_owned();
    }

    let title = chunk
        .lines()
        .find(|line| line.trim_start().starts_with('#'))
        .map(|line| line.trim_start_matches(['#', ' ']).to_owned());

    let third = max_chars / 3;
    let intro = char_slice(chunk, 0, third);
    let mid_start = char_count / 2 - third / 2;
    let middle = char_slice(chunk, mid_start, mid_start + third);
    let ending = char_slice(chunk, char_count - third, char_count);

    match title {
        Some(title) => format!("# {title}\n\n{intro}...\n\n{middle}...\n\n{ending}"),
        None => format!("{intro}...\n\n{middle}...\n\n{ending}"),
    }
}

/// Cache key over the query and a sampled digest of the chunk set, so long
/// candidate lists do not produce unbounded keys.
fn cache_key(query: &str, chunks: &[String]) -> String {
    let normalized = query.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sample = String::new();
    if chunks.len() > 10 {
        for index in [0, chunks.len() / 2, chunks.len() - 1] {
            let chunk = &chunks[index];
            let chars = chunk.chars().count();
            if chars > 300 {
                sample.push_str(&char_slice(chunk, 0, 100));
                sample.push_str(&char_slice(chunk, chars / 2 - 50, chars / 2 + 50));
                sample.push_str(&char_slice(chunk, chars - 100, chars));
            } else {
                sample.push_str(chunk);
            }
        }
    } else {
        for chunk in chunks {
            sample.push_str(&char_slice(chunk, 0, 200));
        }
    }

    let digest = Sha256::digest(format!("{normalized}|{}|{sample}", chunks.len()).as_bytes());
    format!("{digest:x}")
}

/// Second-stage scorer combining lexical, semantic and LLM signals with
/// query-adaptive weights and optional diversification.
pub struct LlmReranker {
    llm: Arc<LlmClient>,
    cache: Mutex<TtlCache>,
}

impl LlmReranker {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            cache: Mutex::new(TtlCache::new()),
        }
    }

    /// Reorders `chunks` by relevance to `query` and truncates to
    /// `max_to_return`. Never fails: progressively simpler fallbacks end at
    /// returning the input order.
    pub async fn rerank(
        &self,
        query: &str,
        chunks: Vec<String>,
        options: RerankOptions,
    ) -> Vec<String> {
        if chunks.len() <= 1 {
            return chunks;
        }

        let key = cache_key(query, &chunks);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                debug!("Rerank cache hit");
                return hit;
            }
        }

        let ranked = match self.hybrid_rerank(query, &chunks, &options).await {
            Ok(ranked) => ranked,
            Err(err) => {
                warn!(error = %err, "Hybrid rerank failed; trying LLM-only fallback");
                match self.simple_rerank(query, &chunks, &options).await {
                    Ok(ranked) => ranked,
                    Err(fallback_err) => {
                        warn!(
                            error = %fallback_err,
                            "Fallback rerank failed; returning input order"
                        );
                        chunks
                            .iter()
                            .take(options.max_to_return)
                            .cloned()
                            .collect()
                    }
                }
            }
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, ranked.clone());
        }
        ranked
    }

    async fn hybrid_rerank(
        &self,
        query: &str,
        chunks: &[String],
        options: &RerankOptions,
    ) -> Result<Vec<String>, AppError> {
        let started = Instant::now();

        // Lexical signal.
        let chunk_tokens: Vec<Vec<String>> =
            chunks.iter().map(|chunk| tokenize(chunk)).collect();
        let index = Bm25Index::new(&chunk_tokens);
        let bm25_scores = index.scores(&tokenize(query));

        // Semantic signal.
        let chunk_embeddings = self.embed_chunks(chunks).await;
        let cosine_scores = match self.llm.embed(query).await {
            Ok(query_embedding) => chunk_embeddings
                .iter()
                .map(|embedding| cosine_similarity(&query_embedding, embedding))
                .collect::<Vec<f32>>(),
            Err(err) => {
                warn!(error = %err, "Query embedding failed; using neutral cosine scores");
                vec![0.5; chunks.len()]
            }
        };

        // LLM signal over the pre-filtered head.
        let candidate_indices: Vec<usize> = if chunks.len() > options.max_to_rerank {
            let bm25_norm = smart_normalize(&bm25_scores);
            let cosine_norm = smart_normalize(&cosine_scores);
            let mut order: Vec<usize> = (0..chunks.len()).collect();
            order.sort_by(|a, b| {
                let score_a = 0.5 * bm25_norm[*a] + 0.5 * cosine_norm[*a];
                let score_b = 0.5 * bm25_norm[*b] + 0.5 * cosine_norm[*b];
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            order.truncate(options.max_to_rerank);
            order
        } else {
            (0..chunks.len()).collect()
        };

        let evaluations = join_all(
            candidate_indices
                .iter()
                .map(|index| self.evaluate_chunk(query, &chunks[*index])),
        )
        .await;

        let mut llm_scores = vec![0.0f32; chunks.len()];
        for (index, score) in candidate_indices.iter().zip(evaluations) {
            llm_scores[*index] = score;
        }

        // Fuse.
        let bm25_norm = smart_normalize(&bm25_scores);
        let cosine_norm = smart_normalize(&cosine_scores);
        let llm_norm = smart_normalize(&llm_scores);
        let weights = adjust_weights(query, SignalWeights::default());
        debug!(?weights, "Rerank weights adapted to query");

        let combined: Vec<f32> = (0..chunks.len())
            .map(|i| {
                weights.bm25 * bm25_norm[i]
                    + weights.cosine * cosine_norm[i]
                    + weights.llm * llm_norm[i]
            })
            .collect();

        let ordered_indices = if options.diversify && chunks.len() > 3 {
            diversified_order(&combined, &chunk_embeddings)
        } else {
            let mut order: Vec<usize> = (0..chunks.len()).collect();
            order.sort_by(|a, b| {
                combined[*b]
                    .partial_cmp(&combined[*a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            order
        };

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            candidates = chunks.len(),
            evaluated = candidate_indices.len(),
            "Hybrid rerank complete"
        );

        Ok(ordered_indices
            .into_iter()
            .take(options.max_to_return)
            .map(|index| chunks[index].clone())
            .collect())
    }

    /// Scores one chunk on the five regulatory-relevance criteria; 0 on any
    /// failure so a bad evaluation never sinks the request.
    async fn evaluate_chunk(&self, query: &str, chunk: &str) -> f32 {
        let segment = representative_segment(chunk, EVAL_MAX_CHARS);
        let user = format!("Consulta: \"{query}\"\n\nFragmento a evaluar:\n---\n{segment}\n---");

        let content = match self
            .llm
            .chat_json_raw(&self.llm.llm_model, EVAL_SYSTEM, &user)
            .await
        {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %err, "Chunk evaluation call failed; scoring 0");
                return 0.0;
            }
        };

        match parse_llm_json::<RawEvaluation>(&content) {
            Ok(evaluation) => {
                let mut global = evaluation.global;
                if !(0.0..=10.0).contains(&global) {
                    global = evaluation.weighted_global();
                }
                global.clamp(0.0, 10.0)
            }
            Err(err) => {
                debug!(error = %err, "Evaluation JSON unparseable; extracting bare number");
                extract_score(&content)
                    .map(|score| score.clamp(0.0, 10.0))
                    .unwrap_or(0.0)
            }
        }
    }

    /// Embeds every chunk in adaptive batches, halving the batch size on
    /// repeated failures and substituting zero vectors per failed chunk.
    async fn embed_chunks(&self, chunks: &[String]) -> Vec<Vec<f32>> {
        let mut batch_size = if chunks.len() <= 10 {
            chunks.len().max(1)
        } else {
            (chunks.len() / 2).clamp(1, 16)
        };

        let mut embeddings = Vec::with_capacity(chunks.len());
        let mut cursor = 0;
        while cursor < chunks.len() {
            let batch: Vec<String> = chunks[cursor..(cursor + batch_size).min(chunks.len())]
                .to_vec();
            let mut attempt = 0;
            loop {
                match self.llm.embed_batch(batch.clone()).await {
                    Ok(mut vectors) => {
                        embeddings.append(&mut vectors);
                        break;
                    }
                    Err(err) => {
                        attempt += 1;
                        if attempt >= EMBED_MAX_RETRIES {
                            warn!(error = %err, "Embedding batch exhausted retries; embedding singly");
                            for chunk in &batch {
                                embeddings.push(self.llm.embed_or_zero(chunk).await);
                            }
                            break;
                        }
                        warn!(
                            error = %err,
                            attempt,
                            "Embedding batch failed; halving batch size"
                        );
                        batch_size = (batch_size / 2).max(1);
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
            cursor += batch.len();
        }

        embeddings
    }

    /// Plain LLM-only fallback over the head of the candidate list.
    async fn simple_rerank(
        &self,
        query: &str,
        chunks: &[String],
        options: &RerankOptions,
    ) -> Result<Vec<String>, AppError> {
        let head = chunks.len().min(options.max_to_rerank);

        let scores = join_all(chunks[..head].iter().map(|chunk| async move {
            let segment = representative_segment(chunk, EVAL_MAX_CHARS);
            let user = format!("Consulta: {query}\n\nFragmento:\n{segment}");
            match self
                .llm
                .chat_text(&self.llm.llm_model, SIMPLE_RERANK_SYSTEM, &user)
                .await
            {
                Ok(content) => extract_score(&content).unwrap_or(0.0),
                Err(_) => 0.0,
            }
        }))
        .await;

        let mut order: Vec<usize> = (0..head).collect();
        order.sort_by(|a, b| {
            scores[*b]
                .partial_cmp(&scores[*a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.extend(head..chunks.len());

        Ok(order
            .into_iter()
            .take(options.max_to_return)
            .map(|index| chunks[index].clone())
            .collect())
    }
}

/// Greedy diversity-aware ordering: always take the best first, then avoid
/// placing a chunk whose embedding is near-identical to any of the last
/// three selections when a less similar strong candidate exists.
fn diversified_order(combined: &[f32], embeddings: &[Vec<f32>]) -> Vec<usize> {
    let mut sorted: Vec<usize> = (0..combined.len()).collect();
    sorted.sort_by(|a, b| {
        combined[*b]
            .partial_cmp(&combined[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Vec<usize> = Vec::with_capacity(sorted.len());
    let mut available: Vec<usize> = sorted.clone();

    while !available.is_empty() {
        let mut pick = available[0];

        if !selected.is_empty() {
            let recent: Vec<usize> =
                selected.iter().rev().take(3).copied().collect();
            let too_similar = |candidate: usize| {
                recent.iter().any(|recent_index| {
                    cosine_similarity(&embeddings[candidate], &embeddings[*recent_index])
                        > SIMILARITY_THRESHOLD
                })
            };

            if too_similar(pick) {
                if let Some(diverse) = available
                    .iter()
                    .copied()
                    .find(|candidate| !too_similar(*candidate))
                {
                    pick = diverse;
                }
            }
        }

        selected.push(pick);
        available.retain(|candidate| *candidate != pick);
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::AppConfig;

    fn test_reranker() -> LlmReranker {
        LlmReranker::new(Arc::new(LlmClient::from_config(&AppConfig::default())))
    }

    #[tokio::test]
    async fn single_candidate_is_returned_untouched() {
        let reranker = test_reranker();
        let out = reranker
            .rerank(
                "consulta",
                vec!["único fragmento".into()],
                RerankOptions::default(),
            )
            .await;
        assert_eq!(out, vec!["único fragmento".to_string()]);
    }

    #[tokio::test]
    async fn empty_candidates_yield_empty_output() {
        let reranker = test_reranker();
        let out = reranker
            .rerank("consulta", Vec::new(), RerankOptions::default())
            .await;
        assert!(out.is_empty());
    }

    #[test]
    fn cache_key_is_stable_for_same_inputs() {
        let chunks: Vec<String> = (0..3).map(|i| format!("fragmento {i}")).collect();
        assert_eq!(cache_key("Consulta  X", &chunks), cache_key("consulta x", &chunks));
        assert_ne!(cache_key("consulta x", &chunks), cache_key("otra", &chunks));
    }

    #[test]
    fn cache_key_samples_long_chunk_lists() {
        let chunks: Vec<String> = (0..30).map(|i| format!("fragmento {i} {}", "x".repeat(400))).collect();
        let key = cache_key("consulta", &chunks);
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn representative_segment_shortens_long_chunks() {
        let chunk = format!("# Artículo 12\n\n{}", "contenido largo ".repeat(200));
        let segment = representative_segment(&chunk, 800);
        assert!(segment.chars().count() < chunk.chars().count());
        assert!(segment.starts_with("# Artículo 12"));
        assert!(segment.contains("..."));
    }

    #[test]
    fn representative_segment_keeps_short_chunks() {
        let chunk = "texto corto";
        assert_eq!(representative_segment(chunk, 800), chunk);
    }

    #[test]
    fn score_extraction_finds_first_number() {
        assert_eq!(extract_score("La puntuación es 7.5 sobre 10"), Some(7.5));
        assert_eq!(extract_score("8"), Some(8.0));
        assert_eq!(extract_score("sin números"), None);
    }

    #[test]
    fn raw_evaluation_recomputes_out_of_range_global() {
        let eval = RawEvaluation {
            pertenencia: 8.0,
            aplicabilidad: 6.0,
            completitud: 5.0,
            jerarquia: 9.0,
            referencias: 4.0,
            global: 42.0,
        };
        let expected = 0.35 * 8.0 + 0.25 * 6.0 + 0.15 * 5.0 + 0.15 * 9.0 + 0.10 * 4.0;
        assert!((eval.weighted_global() - expected).abs() < 1e-6);
    }

    #[test]
    fn diversification_avoids_consecutive_near_duplicates() {
        // Chunks 0 and 1 are nearly identical; 2 points elsewhere.
        let embeddings = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.99, 0.14, 0.0],
            vec![0.0, 1.0, 0.0],
        ];
        let combined = vec![1.0, 0.9, 0.5];

        let order = diversified_order(&combined, &embeddings);
        assert_eq!(order[0], 0, "best-scoring chunk always leads");
        assert_eq!(order[1], 2, "near-duplicate deferred for a diverse pick");
        assert_eq!(order[2], 1);
    }

    #[test]
    fn diversification_takes_best_when_no_diverse_candidate() {
        let embeddings = vec![
            vec![1.0, 0.0],
            vec![0.99, 0.1],
            vec![0.98, 0.15],
        ];
        let combined = vec![1.0, 0.8, 0.6];

        let order = diversified_order(&combined, &embeddings);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], 0);
    }

    #[test]
    fn ttl_cache_evicts_oldest_at_capacity() {
        let mut cache = TtlCache::new();
        for i in 0..CACHE_CAPACITY {
            cache.insert(format!("key{i}"), vec![format!("v{i}")]);
        }
        // Refresh key0 so key1 becomes the eviction candidate.
        let _ = cache.get("key0");
        cache.insert("overflow".into(), vec!["v".into()]);

        assert!(cache.get("key0").is_some());
        assert!(cache.get("overflow").is_some());
        assert_eq!(cache.entries.len(), CACHE_CAPACITY);
    }
}
