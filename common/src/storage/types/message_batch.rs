use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(MessageBatch, "message_batch", {
    session_id: String,
    payload: serde_json::Value,
    token_estimate: i64
});

impl MessageBatch {
    pub fn new(session_id: String, payload: serde_json::Value, token_estimate: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            session_id,
            payload,
            token_estimate,
        }
    }

    /// Loads batches newest-first; `(session_id, created_at DESC)` is the
    /// canonical order for reconstructing history.
    pub async fn load_for_session(
        session_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE session_id = $session_id ORDER BY created_at DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("session_id", session_id.to_owned()))
            .await?;

        let batches: Vec<Self> = response.take(0)?;
        Ok(batches)
    }

    pub async fn delete_for_session(
        session_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query("DELETE type::table($table) WHERE session_id = $session_id")
            .bind(("table", Self::table_name()))
            .bind(("session_id", session_id.to_owned()))
            .await?;
        Ok(())
    }
}
