pub mod memory;
pub mod plan;
pub mod report;

use std::{path::PathBuf, sync::Arc};

use common::{
    error::AppError, storage::db::SurrealDbClient, utils::config::AppConfig,
    utils::llm::LlmClient,
};
use retrieval_pipeline::{
    cache::ResponseCache, reranker::LlmReranker, Complexity, HybridRetriever, QueryInfo,
    QueryUnderstanding, RequestState, RetrievalConfig, NO_RESULTS_MARKER,
};
use tracing::{info, instrument, warn};

use memory::{ChatMessage, MemoryManager, DEFAULT_HISTORY_TOKENS};
use plan::{OrchestratorPlan, Planner, PrimaryAgent};
use report::ReportFormatter;

const ANSWER_SYSTEM: &str = "Eres un experto en normativa y cumplimiento regulatorio. \
Responde la consulta del usuario basándote exclusivamente en la documentación recuperada y, \
cuando exista, en el historial de la conversación. Cita los artículos y normas relevantes. \
Si la documentación no cubre la consulta, dilo explícitamente.";

const SYNTHESIS_SYSTEM: &str = "Eres un experto en normativa. Combina las respuestas \
parciales a las sub-consultas en una única respuesta coherente y completa, eliminando \
redundancias y conservando todas las citas normativas.";

/// Final outcome of one orchestrated query.
#[derive(Debug)]
pub struct QueryOutcome {
    pub response: String,
    pub session_id: String,
    pub plan: OrchestratorPlan,
    pub additional_info: serde_json::Value,
    pub from_cache: bool,
}

/// Thin state machine over the retrieval core: plan, optionally understand,
/// retrieve, compose, persist.
pub struct Orchestrator {
    llm: Arc<LlmClient>,
    retriever: HybridRetriever,
    understanding: QueryUnderstanding,
    planner: Planner,
    memory: MemoryManager,
    response_cache: ResponseCache,
    report: ReportFormatter,
}

impl Orchestrator {
    pub fn new(db: Arc<SurrealDbClient>, llm: Arc<LlmClient>, config: &AppConfig) -> Self {
        let reranker = Arc::new(LlmReranker::new(Arc::clone(&llm)));
        let retriever = HybridRetriever::new(
            Arc::clone(&db),
            Arc::clone(&llm),
            reranker,
            RetrievalConfig::from_app_config(config),
        );

        Self {
            understanding: QueryUnderstanding::new(Arc::clone(&llm)),
            planner: Planner::new(Arc::clone(&llm)),
            memory: MemoryManager::new(Arc::clone(&db), Arc::clone(&llm)),
            response_cache: ResponseCache::default(),
            report: ReportFormatter::new(
                Arc::clone(&llm),
                config.report_template_path.clone().map(PathBuf::from),
                PathBuf::from(&config.data_dir).join("reports"),
            ),
            retriever,
            llm,
        }
    }

    /// Handles one user query end to end. Never leaks internals: the result
    /// is an answer string plus routing metadata.
    #[instrument(skip(self), fields(user_id))]
    pub async fn process_query(
        &self,
        query: &str,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<QueryOutcome, AppError> {
        let mut session = self.memory.get_or_create_session(user_id, session_id).await?;
        let history = self
            .memory
            .load_messages(&session.id, DEFAULT_HISTORY_TOKENS)
            .await?;
        let first_turn = history.is_empty();

        // Context-free turns may be served straight from the cache.
        if first_turn {
            if let Some(cached) = self.response_cache.get(query) {
                info!("Serving response from cache");
                return Ok(QueryOutcome {
                    response: cached,
                    session_id: session.id,
                    plan: OrchestratorPlan::default(),
                    additional_info: serde_json::Value::Null,
                    from_cache: true,
                });
            }
        }

        let plan = self.planner.plan(query).await;
        info!(primary_agent = ?plan.primary_agent, "Orchestration plan selected");

        let query_info = if plan.requires_query_understanding {
            Some(self.understanding.understand(query).await)
        } else {
            None
        };

        let effective_query = query_info
            .as_ref()
            .filter(|info| !info.expanded_query.trim().is_empty())
            .map(|info| info.expanded_query.clone())
            .unwrap_or_else(|| query.to_owned());

        let mut state = RequestState::new();
        let mut additional_info = plan.additional_info.clone();

        let response = if plan.requires_complex_handling
            && query_info
                .as_ref()
                .map(|info| !info.decomposed_queries.is_empty())
                .unwrap_or(false)
        {
            self.answer_decomposed(
                query,
                query_info.as_ref(),
                &history,
                &mut state,
            )
            .await?
        } else {
            match plan.primary_agent {
                PrimaryAgent::Report => {
                    let analysis = self
                        .compliance_answer(
                            &effective_query,
                            query_info.as_ref(),
                            &history,
                            &mut state,
                        )
                        .await?;
                    let report_path = self.report.generate(query, &analysis).await?;
                    if let serde_json::Value::Object(map) = &mut additional_info {
                        map.insert(
                            "report_path".into(),
                            report_path.to_string_lossy().into_owned().into(),
                        );
                    } else {
                        additional_info = serde_json::json!({
                            "report_path": report_path.to_string_lossy(),
                        });
                    }
                    format!(
                        "Se generó el reporte solicitado en {}.",
                        report_path.display()
                    )
                }
                PrimaryAgent::Compliance | PrimaryAgent::QueryUnderstanding => {
                    self.compliance_answer(
                        &effective_query,
                        query_info.as_ref(),
                        &history,
                        &mut state,
                    )
                    .await?
                }
            }
        };

        // Persist the turn and fold query-derived context into the session.
        let turn = vec![ChatMessage::user(query), ChatMessage::assistant(&response)];
        self.memory.save_messages(&mut session, &turn).await?;

        if let Some(info) = &query_info {
            let topics: Vec<String> = info
                .keywords
                .iter()
                .map(|keyword| keyword.word.clone())
                .collect();
            let regulations: Vec<String> = info
                .entities
                .iter()
                .filter(|entity| entity.entity_type == "regulation")
                .map(|entity| entity.text.clone())
                .collect();
            let entities: Vec<String> = info
                .entities
                .iter()
                .filter(|entity| entity.entity_type != "regulation")
                .map(|entity| entity.text.clone())
                .collect();
            if let Err(err) = self
                .memory
                .update_context(&mut session, &topics, &regulations, &entities, &[])
                .await
            {
                warn!(error = %err, "Failed to update session context metadata");
            }
        }

        if first_turn {
            self.response_cache.set(query, response.clone());
        }

        Ok(QueryOutcome {
            response,
            session_id: session.id,
            plan,
            additional_info,
            from_cache: false,
        })
    }

    /// Compliance path: hybrid retrieval followed by answer composition.
    async fn compliance_answer(
        &self,
        query: &str,
        query_info: Option<&QueryInfo>,
        history: &[ChatMessage],
        state: &mut RequestState,
    ) -> Result<String, AppError> {
        let context = self.retriever.retrieve(query, query_info, state).await?;

        if context == NO_RESULTS_MARKER {
            return Ok(NO_RESULTS_MARKER.to_owned());
        }

        let model = if query_info
            .map(|info| info.complexity == Complexity::Complex)
            .unwrap_or(false)
        {
            &self.llm.llm_model_advanced
        } else {
            &self.llm.llm_model
        };

        let mut user = String::new();
        if !history.is_empty() {
            let recent: String = history
                .iter()
                .rev()
                .take(6)
                .rev()
                .map(|message| format!("{}: {}", message.role, message.content))
                .collect::<Vec<_>>()
                .join("\n");
            user.push_str(&format!("Historial reciente:\n{recent}\n\n"));
        }
        user.push_str(&format!(
            "Documentación recuperada:\n{context}\n\nConsulta: {query}"
        ));

        self.llm.chat_text(model, ANSWER_SYSTEM, &user).await
    }

    /// Complex path: one compliance run per sub-query, then one synthesis
    /// call merging the partial answers.
    async fn answer_decomposed(
        &self,
        original_query: &str,
        query_info: Option<&QueryInfo>,
        history: &[ChatMessage],
        state: &mut RequestState,
    ) -> Result<String, AppError> {
        let sub_queries: Vec<String> = query_info
            .map(|info| info.decomposed_queries.clone())
            .unwrap_or_default();

        let mut partial_answers = Vec::with_capacity(sub_queries.len());
        for sub_query in &sub_queries {
            info!(sub_query, "Answering decomposed sub-query");
            let answer = self
                .compliance_answer(sub_query, query_info, history, state)
                .await?;
            partial_answers.push(format!("Sub-consulta: {sub_query}\nRespuesta: {answer}"));
        }

        let user = format!(
            "Consulta original: {original_query}\n\nRespuestas parciales:\n\n{}",
            partial_answers.join("\n\n---\n\n")
        );
        self.llm
            .chat_text(&self.llm.llm_model_advanced, SYNTHESIS_SYSTEM, &user)
            .await
    }
}
