use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::message_batch::MessageBatch;

stored_object!(ConversationSession, "conversation_session", {
    user_id: String,
    metadata: serde_json::Value,
    total_tokens: i64
});

/// Rolling number of key points kept in the session's context bag.
const MAX_KEY_POINTS: usize = 20;

impl ConversationSession {
    pub fn new(user_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            metadata: serde_json::json!({}),
            total_tokens: 0,
        }
    }

    /// Fetches the session when the caller supplied an id, creating a fresh
    /// one otherwise (or when the id is unknown).
    pub async fn get_or_create(
        user_id: &str,
        session_id: Option<&str>,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        if let Some(id) = session_id {
            if let Some(existing) = db.get_item::<Self>(id).await? {
                return Ok(existing);
            }
        }

        let session = Self::new(user_id.to_owned());
        db.store_item(session.clone()).await?;
        Ok(session)
    }

    /// Bumps `updated_at` and accumulates the turn's token estimate.
    pub async fn touch(&mut self, added_tokens: i64, db: &SurrealDbClient) -> Result<(), AppError> {
        self.total_tokens = self.total_tokens.saturating_add(added_tokens.max(0));
        self.updated_at = Utc::now();

        let _updated: Option<Self> = db
            .client
            .query(
                "UPDATE type::thing('conversation_session', $id) \
                 SET total_tokens = $tokens, updated_at = time::now() RETURN AFTER",
            )
            .bind(("id", self.id.clone()))
            .bind(("tokens", self.total_tokens))
            .await?
            .take(0)?;

        Ok(())
    }

    pub fn conversation_summary(&self) -> Option<String> {
        self.metadata
            .get("conversation_summary")
            .and_then(|value| value.as_str())
            .map(ToOwned::to_owned)
    }

    pub async fn set_conversation_summary(
        &mut self,
        summary: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert("conversation_summary".into(), summary.into());
            map.insert(
                "summary_generated_at".into(),
                Utc::now().to_rfc3339().into(),
            );
        }
        self.persist_metadata(db).await
    }

    /// Merges topics, regulations and entities into the session's context
    /// bag, de-duplicating and keeping the latest key points.
    pub async fn update_context_metadata(
        &mut self,
        topics: &[String],
        regulations: &[String],
        entities: &[String],
        key_points: &[String],
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let bag = self
            .metadata
            .as_object_mut()
            .and_then(|map| {
                if !map.contains_key("context_metadata") {
                    map.insert("context_metadata".into(), serde_json::json!({}));
                }
                map.get_mut("context_metadata")
            })
            .and_then(|value| value.as_object_mut())
            .ok_or_else(|| AppError::InternalError("session metadata is not an object".into()))?;

        for (key, incoming) in [
            ("topics", topics),
            ("regulations", regulations),
            ("entities", entities),
        ] {
            let mut merged: Vec<String> = bag
                .get(key)
                .and_then(|value| value.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(ToOwned::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            for value in incoming {
                if !merged.iter().any(|existing| existing == value) {
                    merged.push(value.clone());
                }
            }
            bag.insert(key.into(), serde_json::json!(merged));
        }

        let mut points: Vec<String> = bag
            .get("key_points")
            .and_then(|value| value.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(ToOwned::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        points.extend(key_points.iter().cloned());
        if points.len() > MAX_KEY_POINTS {
            points = points.split_off(points.len() - MAX_KEY_POINTS);
        }
        bag.insert("key_points".into(), serde_json::json!(points));

        self.persist_metadata(db).await
    }

    async fn persist_metadata(&mut self, db: &SurrealDbClient) -> Result<(), AppError> {
        self.updated_at = Utc::now();
        let _updated: Option<Self> = db
            .client
            .query(
                "UPDATE type::thing('conversation_session', $id) \
                 SET metadata = $metadata, updated_at = time::now() RETURN AFTER",
            )
            .bind(("id", self.id.clone()))
            .bind(("metadata", self.metadata.clone()))
            .await?
            .take(0)?;

        Ok(())
    }

    /// Removes the session and every message batch attached to it.
    pub async fn delete_cascade(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        MessageBatch::delete_for_session(&self.id, db).await?;
        let _deleted: Option<Self> = db.delete_item(&self.id).await?;
        Ok(())
    }
}
