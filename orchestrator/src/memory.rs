use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{conversation_session::ConversationSession, message_batch::MessageBatch},
    },
    utils::llm::LlmClient,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Default token cap when loading history.
pub const DEFAULT_HISTORY_TOKENS: usize = 100_000;

const SUMMARY_SYSTEM: &str = "Resume la siguiente conversación sobre normativa en un párrafo \
breve que capture los temas tratados, las normas citadas y las conclusiones alcanzadas. \
Responde solo con el resumen.";

/// One message of a persisted turn. `parts` carries provider-specific
/// payload tags; messages tagged `tool-result` are filtered out on load for
/// chat-completions API compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub parts: Vec<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            parts: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            parts: Vec::new(),
        }
    }

    fn is_tool_result(&self) -> bool {
        self.parts.iter().any(|part| part == "tool-result")
    }

    fn estimated_tokens(&self) -> usize {
        self.content.chars().count() / 4
    }
}

/// Conversational memory over the session and message-batch tables. Saves
/// for the same session are serialized through a per-session mutex so
/// interleaved turns cannot corrupt the batch sequence.
pub struct MemoryManager {
    db: Arc<SurrealDbClient>,
    llm: Arc<LlmClient>,
    save_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryManager {
    pub fn new(db: Arc<SurrealDbClient>, llm: Arc<LlmClient>) -> Self {
        Self {
            db,
            llm,
            save_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<ConversationSession, AppError> {
        ConversationSession::get_or_create(user_id, session_id, &self.db).await
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.save_locks.lock().await;
        Arc::clone(
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Persists one turn's messages as a batch and bumps the session token
    /// counter with the chars/4 estimate.
    #[instrument(skip_all, fields(session_id = %session.id, messages = messages.len()))]
    pub async fn save_messages(
        &self,
        session: &mut ConversationSession,
        messages: &[ChatMessage],
    ) -> Result<(), AppError> {
        let lock = self.lock_for(&session.id).await;
        let _guard = lock.lock().await;

        let token_estimate: usize = messages
            .iter()
            .map(ChatMessage::estimated_tokens)
            .sum();

        let batch = MessageBatch::new(
            session.id.clone(),
            serde_json::to_value(messages)?,
            token_estimate as i64,
        );
        self.db.store_item(batch).await?;
        session.touch(token_estimate as i64, &self.db).await?;

        debug!(token_estimate, "Turn saved to memory");
        Ok(())
    }

    /// Loads recent history in chronological order, newest batches first
    /// until the token budget is reached, with tool-result messages
    /// filtered out.
    #[instrument(skip(self))]
    pub async fn load_messages(
        &self,
        session_id: &str,
        max_tokens: usize,
    ) -> Result<Vec<ChatMessage>, AppError> {
        let batches = MessageBatch::load_for_session(session_id, &self.db).await?;

        let mut kept_batches: Vec<Vec<ChatMessage>> = Vec::new();
        let mut used_tokens = 0usize;

        for batch in batches {
            let messages: Vec<ChatMessage> = match serde_json::from_value(batch.payload.clone()) {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(batch_id = %batch.id, error = %err, "Skipping unreadable message batch");
                    continue;
                }
            };

            let batch_tokens: usize = messages.iter().map(ChatMessage::estimated_tokens).sum();
            if used_tokens + batch_tokens > max_tokens && !kept_batches.is_empty() {
                break;
            }
            used_tokens += batch_tokens;
            kept_batches.push(messages);
        }

        // Newest-first batches back to chronological order.
        kept_batches.reverse();
        Ok(kept_batches
            .into_iter()
            .flatten()
            .filter(|message| !message.is_tool_result())
            .collect())
    }

    /// Returns the stored conversation summary, regenerating it when turns
    /// were saved after the summary was produced.
    pub async fn get_or_create_summary(
        &self,
        session: &mut ConversationSession,
    ) -> Result<String, AppError> {
        let batches = MessageBatch::load_for_session(&session.id, &self.db).await?;
        let latest_turn: Option<DateTime<Utc>> = batches.first().map(|batch| batch.created_at);

        let summary_stamp = session
            .metadata
            .get("summary_generated_at")
            .and_then(|value| value.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|stamp| stamp.with_timezone(&Utc));

        let stale = match (latest_turn, summary_stamp) {
            (Some(turn), Some(stamp)) => turn > stamp,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if !stale {
            if let Some(summary) = session.conversation_summary() {
                return Ok(summary);
            }
        }

        let history = self
            .load_messages(&session.id, DEFAULT_HISTORY_TOKENS)
            .await?;
        if history.is_empty() {
            return Ok(String::new());
        }

        let transcript: String = history
            .iter()
            .map(|message| format!("{}: {}", message.role, message.content))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = self
            .llm
            .chat_text(&self.llm.llm_model, SUMMARY_SYSTEM, &transcript)
            .await?;
        session.set_conversation_summary(&summary, &self.db).await?;

        Ok(summary)
    }

    /// Merges query-derived context into the session's rolling bag.
    pub async fn update_context(
        &self,
        session: &mut ConversationSession,
        topics: &[String],
        regulations: &[String],
        entities: &[String],
        key_points: &[String],
    ) -> Result<(), AppError> {
        session
            .update_context_metadata(topics, regulations, entities, key_points, &self.db)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::AppConfig;
    use uuid::Uuid;

    async fn manager() -> MemoryManager {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("db"),
        );
        let llm = Arc::new(LlmClient::from_config(&AppConfig::default()));
        MemoryManager::new(db, llm)
    }

    #[tokio::test]
    async fn saved_turn_round_trips_in_order() {
        let memory = manager().await;
        let mut session = memory
            .get_or_create_session("user_1", None)
            .await
            .expect("session");

        let turn = vec![
            ChatMessage::user("¿Qué es el GDPR?"),
            ChatMessage::assistant("El GDPR es el reglamento europeo de protección de datos."),
        ];
        memory
            .save_messages(&mut session, &turn)
            .await
            .expect("save");

        let loaded = memory
            .load_messages(&session.id, DEFAULT_HISTORY_TOKENS)
            .await
            .expect("load");
        assert_eq!(loaded, turn);
        assert!(session.total_tokens > 0);
    }

    #[tokio::test]
    async fn later_batches_come_after_earlier_ones() {
        let memory = manager().await;
        let mut session = memory
            .get_or_create_session("user_1", None)
            .await
            .expect("session");

        memory
            .save_messages(&mut session, &[ChatMessage::user("primera")])
            .await
            .expect("save 1");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        memory
            .save_messages(&mut session, &[ChatMessage::user("segunda")])
            .await
            .expect("save 2");

        let loaded = memory
            .load_messages(&session.id, DEFAULT_HISTORY_TOKENS)
            .await
            .expect("load");
        assert_eq!(loaded[0].content, "primera");
        assert_eq!(loaded[1].content, "segunda");
    }

    #[tokio::test]
    async fn tool_result_messages_are_filtered_on_load() {
        let memory = manager().await;
        let mut session = memory
            .get_or_create_session("user_1", None)
            .await
            .expect("session");

        let turn = vec![
            ChatMessage::user("consulta"),
            ChatMessage {
                role: "tool".into(),
                content: "resultado bruto de la herramienta".into(),
                parts: vec!["tool-result".into()],
            },
            ChatMessage::assistant("respuesta"),
        ];
        memory
            .save_messages(&mut session, &turn)
            .await
            .expect("save");

        let loaded = memory
            .load_messages(&session.id, DEFAULT_HISTORY_TOKENS)
            .await
            .expect("load");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|message| message.role != "tool"));
    }

    #[tokio::test]
    async fn token_budget_keeps_newest_batches() {
        let memory = manager().await;
        let mut session = memory
            .get_or_create_session("user_1", None)
            .await
            .expect("session");

        let old_turn = vec![ChatMessage::user("x".repeat(4000))];
        memory
            .save_messages(&mut session, &old_turn)
            .await
            .expect("save old");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let new_turn = vec![ChatMessage::user("consulta reciente")];
        memory
            .save_messages(&mut session, &new_turn)
            .await
            .expect("save new");

        // Budget only fits the newest batch.
        let loaded = memory.load_messages(&session.id, 100).await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "consulta reciente");
    }

    #[tokio::test]
    async fn concurrent_saves_to_one_session_all_land() {
        let memory = Arc::new(manager().await);
        let session = memory
            .get_or_create_session("user_1", None)
            .await
            .expect("session");

        let mut handles = Vec::new();
        for index in 0..5 {
            let memory = Arc::clone(&memory);
            let session_id = session.id.clone();
            handles.push(tokio::spawn(async move {
                let mut session = memory
                    .get_or_create_session("user_1", Some(&session_id))
                    .await
                    .expect("session");
                memory
                    .save_messages(
                        &mut session,
                        &[ChatMessage::user(format!("turno {index}"))],
                    )
                    .await
                    .expect("save");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let loaded = memory
            .load_messages(&session.id, DEFAULT_HISTORY_TOKENS)
            .await
            .expect("load");
        assert_eq!(loaded.len(), 5);
    }
}
