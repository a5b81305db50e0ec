use std::sync::Arc;

use common::{error::AppError, utils::llm::LlmClient};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Complexity triage buckets for a user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Simple
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub name: String,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub text: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Keyword {
    pub word: String,
    #[serde(default)]
    pub importance: f32,
}

/// Structured analysis of a user query, consumed by retrieval and ranking.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryInfo {
    pub original_query: String,
    pub expanded_query: String,
    pub search_query: String,
    #[serde(default)]
    pub decomposed_queries: Vec<String>,
    #[serde(default)]
    pub intents: Vec<Intent>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub keywords: Vec<Keyword>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub domain_terms: Vec<String>,
    #[serde(default)]
    pub estimated_search_quality: f32,
}

impl QueryInfo {
    /// Minimal analysis for degenerate inputs and fallback paths.
    pub fn minimal(query: &str) -> Self {
        let search_query = if query.trim().is_empty() {
            "consulta vacía".to_string()
        } else {
            query.to_owned()
        };

        Self {
            original_query: query.to_owned(),
            expanded_query: query.to_owned(),
            search_query,
            complexity: Complexity::Simple,
            language: "es".into(),
            estimated_search_quality: 0.5,
            ..Self::default()
        }
    }
}

/// Raw shapes the LLM is asked to produce. Every field defaults so a
/// partially valid object still maps into a usable `QueryInfo`.
#[derive(Debug, Deserialize, Default)]
struct RawAnalysis {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    expanded_query: Option<String>,
    #[serde(default)]
    search_query: Option<String>,
    #[serde(default)]
    decomposed_queries: Vec<String>,
    #[serde(default)]
    intents: Vec<Intent>,
    #[serde(default)]
    entities: Vec<Entity>,
    #[serde(default)]
    keywords: Vec<Keyword>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    domain_terms: Vec<String>,
    #[serde(default)]
    estimated_search_quality: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct TriageResponse {
    is_complex: bool,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

const TRIAGE_SYSTEM: &str = "Eres un clasificador de consultas regulatorias. \
Decide si la consulta requiere un análisis complejo (varias preguntas, comparaciones, \
análisis normativo profundo) o puede tratarse como una consulta directa. \
Responde únicamente un objeto JSON: {\"is_complex\": bool, \"reason\": string}.";

const SIMPLE_SYSTEM: &str = "Eres un analizador de consultas sobre normativa. \
Devuelve un objeto JSON con: language (código ISO), entities (lista de objetos \
{text, type} donde type es regulation|region|program|process|technical_requirement|other), \
keywords (lista de {word, importance} con importance entre 0 y 1), \
intents (lista de {name, confidence}), complexity (simple|medium|complex) y \
search_query (versión optimizada de la consulta para búsqueda documental).";

const COMPLEX_SYSTEM: &str = "Eres un analizador experto de consultas regulatorias. \
Devuelve un objeto JSON con: language, expanded_query (consulta reformulada y ampliada), \
search_query (versión optimizada para recuperación), decomposed_queries (sub-preguntas si \
la consulta combina varias), intents ({name, confidence}), entities ({text, type} con type \
regulation|region|program|process|technical_requirement|other), keywords ({word, importance}), \
domain_terms (términos técnicos del dominio), complexity (simple|medium|complex) y \
estimated_search_quality (0 a 1).";

/// Turns raw user queries into structured `QueryInfo` records. All failure
/// modes degrade to progressively simpler analyses; this type never errors.
pub struct QueryUnderstanding {
    llm: Arc<LlmClient>,
}

impl QueryUnderstanding {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn understand(&self, query: &str) -> QueryInfo {
        if query.trim().is_empty() {
            return QueryInfo::minimal(query);
        }

        let complexity = self.triage(query).await;
        debug!(?complexity, "Query triage complete");

        let analyzed = if complexity == Complexity::Complex {
            match self.analyze_complex(query).await {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(error = %err, "Complex analysis failed; falling back to simple path");
                    self.analyze_simple(query).await.ok()
                }
            }
        } else {
            self.analyze_simple(query).await.ok()
        };

        let mut info = analyzed.unwrap_or_else(|| synthesize_fallback(query));
        if info.complexity == Complexity::Simple && complexity != Complexity::Simple {
            info.complexity = complexity;
        }
        post_fill(&mut info);
        info
    }

    /// Cheap complexity triage; only mid-range queries consult the LLM.
    async fn triage(&self, query: &str) -> Complexity {
        let words = query.split_whitespace().count();
        let questions = query.matches('?').count();

        if words > 20 || questions > 1 {
            return Complexity::Complex;
        }
        if words <= 10 && questions <= 1 {
            return Complexity::Simple;
        }

        match self
            .llm
            .chat_json::<TriageResponse>(&self.llm.llm_model, TRIAGE_SYSTEM, query)
            .await
        {
            Ok(response) if response.is_complex => Complexity::Complex,
            Ok(_) => Complexity::Medium,
            Err(err) => {
                warn!(error = %err, "Complexity triage call failed; assuming medium");
                Complexity::Medium
            }
        }
    }

    async fn analyze_simple(&self, query: &str) -> Result<QueryInfo, AppError> {
        let raw = self
            .llm
            .chat_json::<RawAnalysis>(&self.llm.llm_model, SIMPLE_SYSTEM, query)
            .await?;
        Ok(map_raw(query, raw, Complexity::Simple))
    }

    async fn analyze_complex(&self, query: &str) -> Result<QueryInfo, AppError> {
        let raw = self
            .llm
            .chat_json::<RawAnalysis>(&self.llm.llm_model_advanced, COMPLEX_SYSTEM, query)
            .await?;
        Ok(map_raw(query, raw, Complexity::Complex))
    }
}

fn parse_complexity(value: Option<&str>, fallback: Complexity) -> Complexity {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("simple") => Complexity::Simple,
        Some("medium") | Some("media") => Complexity::Medium,
        Some("complex") | Some("compleja") => Complexity::Complex,
        _ => fallback,
    }
}

fn map_raw(query: &str, raw: RawAnalysis, fallback_complexity: Complexity) -> QueryInfo {
    QueryInfo {
        original_query: query.to_owned(),
        expanded_query: raw.expanded_query.unwrap_or_default(),
        search_query: raw.search_query.unwrap_or_default(),
        decomposed_queries: raw.decomposed_queries,
        intents: raw.intents,
        entities: raw.entities,
        keywords: raw.keywords,
        complexity: parse_complexity(raw.complexity.as_deref(), fallback_complexity),
        language: raw.language.unwrap_or_else(|| "es".into()),
        domain_terms: raw.domain_terms,
        estimated_search_quality: raw.estimated_search_quality.unwrap_or(0.0),
    }
}

/// Last-resort analysis when every LLM path failed.
fn synthesize_fallback(query: &str) -> QueryInfo {
    let first_word = query.split_whitespace().next().unwrap_or("").to_owned();
    QueryInfo {
        intents: vec![Intent {
            name: "consulta_general".into(),
            confidence: 1.0,
        }],
        keywords: if first_word.is_empty() {
            Vec::new()
        } else {
            vec![Keyword {
                word: first_word,
                importance: 1.0,
            }]
        },
        ..QueryInfo::minimal(query)
    }
}

/// Ensures the retrieval-facing fields are populated and fills the search
/// quality estimate heuristically when the model omitted it.
fn post_fill(info: &mut QueryInfo) {
    if info.search_query.trim().is_empty() {
        info.search_query = info.original_query.clone();
    }
    if info.expanded_query.trim().is_empty() {
        info.expanded_query = info.original_query.clone();
    }
    if info.estimated_search_quality <= 0.0 {
        let mut quality: f32 = 0.5;
        if !info.entities.is_empty() {
            quality += 0.2;
        }
        if info.keywords.len() > 2 {
            quality += 0.2;
        }
        if info.complexity != Complexity::Simple {
            quality += 0.1;
        }
        info.estimated_search_quality = quality.min(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_yields_minimal_info() {
        let info = QueryInfo::minimal("");
        assert_eq!(info.complexity, Complexity::Simple);
        assert_eq!(info.search_query, "consulta vacía");
    }

    #[test]
    fn fallback_uses_first_word_keyword() {
        let info = synthesize_fallback("minimización de datos");
        assert_eq!(info.intents[0].name, "consulta_general");
        assert_eq!(info.keywords[0].word, "minimización");
        assert_eq!(info.complexity, Complexity::Simple);
    }

    #[test]
    fn post_fill_defaults_queries_to_original() {
        let mut info = QueryInfo {
            original_query: "¿Qué es el GDPR?".into(),
            ..QueryInfo::default()
        };
        post_fill(&mut info);
        assert_eq!(info.search_query, "¿Qué es el GDPR?");
        assert_eq!(info.expanded_query, "¿Qué es el GDPR?");
    }

    #[test]
    fn quality_heuristic_accumulates_signals() {
        let mut info = QueryInfo {
            original_query: "q".into(),
            entities: vec![Entity {
                text: "GDPR".into(),
                entity_type: "regulation".into(),
            }],
            keywords: vec![
                Keyword {
                    word: "a".into(),
                    importance: 0.5,
                },
                Keyword {
                    word: "b".into(),
                    importance: 0.5,
                },
                Keyword {
                    word: "c".into(),
                    importance: 0.5,
                },
            ],
            complexity: Complexity::Medium,
            ..QueryInfo::default()
        };
        post_fill(&mut info);
        assert!((info.estimated_search_quality - 1.0).abs() < 1e-6);
    }

    #[test]
    fn raw_analysis_parses_llm_shape() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{
                "language": "es",
                "search_query": "artículo 3 LFPDPPP",
                "entities": [{"text": "LFPDPPP", "type": "regulation"}],
                "keywords": [{"word": "artículo", "importance": 0.9}],
                "intents": [{"name": "busqueda_articulo", "confidence": 0.8}],
                "complexity": "medium"
            }"#,
        )
        .expect("parse raw analysis");

        let info = map_raw("query", raw, Complexity::Simple);
        assert_eq!(info.entities[0].entity_type, "regulation");
        assert_eq!(info.complexity, Complexity::Medium);
        assert_eq!(info.language, "es");
    }

    #[test]
    fn complexity_parser_handles_unknown_values() {
        assert_eq!(parse_complexity(Some("weird"), Complexity::Medium), Complexity::Medium);
        assert_eq!(parse_complexity(None, Complexity::Complex), Complexity::Complex);
        assert_eq!(parse_complexity(Some("SIMPLE"), Complexity::Complex), Complexity::Simple);
    }
}
