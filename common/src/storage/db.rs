use std::ops::Deref;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

use crate::error::AppError;

use super::types::StoredObject;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Defines the vector and lookup indexes the retrieval pipeline relies
    /// on. Idempotent; run at startup with the configured corpus table.
    pub async fn ensure_initialized(
        &self,
        corpus: &str,
        embedding_dimensions: usize,
    ) -> Result<(), AppError> {
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_embedding_{corpus} ON {corpus} \
                 FIELDS embedding HNSW DIMENSION {embedding_dimensions}"
            ))
            .await?;
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_cluster_{corpus} ON {corpus} FIELDS metadata.cluster_id"
            ))
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_batch_session ON message_batch FIELDS session_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_session_user ON conversation_session FIELDS user_id")
            .await?;

        Ok(())
    }

    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
