use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::serde_helpers::deserialize_flexible_id},
};

/// Chunk metadata stored alongside the embedding. Document-level fields are
/// replicated so the lexical filter can fall back to chunk-local status when
/// no parent document row exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub chunk_size: usize,
    pub source: String,
    pub date: String,
    pub category: String,
    pub keywords: String,
    #[serde(default = "default_cluster_id")]
    pub cluster_id: i64,
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,
    #[serde(default)]
    pub article_number: Option<String>,
    #[serde(default)]
    pub article_title: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub document_title: Option<String>,
    #[serde(default)]
    pub issuing_authority: Option<String>,
    #[serde(default)]
    pub publication_date: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub official_source: Option<String>,
    #[serde(default = "default_embedding_type")]
    pub embedding_type: String,
    #[serde(default)]
    pub has_overlap: bool,
    #[serde(default)]
    pub clustering_method: String,
    #[serde(default)]
    pub is_subdivision: bool,
}

fn default_cluster_id() -> i64 {
    -1
}

fn default_cluster_size() -> usize {
    1
}

fn default_embedding_type() -> String {
    "enriched_with_context".to_string()
}

impl Default for ChunkMetadata {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            source: String::new(),
            date: String::new(),
            category: String::new(),
            keywords: String::new(),
            cluster_id: default_cluster_id(),
            cluster_size: default_cluster_size(),
            article_number: None,
            article_title: None,
            document_type: None,
            document_title: None,
            issuing_authority: None,
            publication_date: None,
            jurisdiction: None,
            status: None,
            document_number: None,
            official_source: None,
            embedding_type: default_embedding_type(),
            has_overlap: false,
            clustering_method: String::new(),
            is_subdivision: false,
        }
    }
}

/// One retrievable fragment of a regulatory document. The table it lives in
/// is the configured corpus, so every accessor takes the table name instead
/// of hard-coding it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredChunk {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub url: String,
    pub chunk_number: i64,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub document_id: Option<String>,
}

/// Vector search hit with its cosine similarity.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkHit {
    #[serde(flatten)]
    pub chunk: StoredChunk,
    pub score: f32,
}

impl StoredChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        chunk_number: i64,
        title: String,
        summary: String,
        content: String,
        metadata: ChunkMetadata,
        embedding: Vec<f32>,
        document_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            chunk_number,
            title,
            summary,
            content,
            metadata,
            embedding,
            document_id,
        }
    }

    pub async fn insert(&self, corpus: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let _created: Option<Self> = db
            .client
            .create((corpus, self.id.as_str()))
            .content(self.clone())
            .await?;
        Ok(())
    }

    /// KNN match against the corpus embedding index, highest cosine first.
    pub async fn vector_match(
        corpus: &str,
        query_embedding: Vec<f32>,
        take: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<ChunkHit>, AppError> {
        let sql = format!(
            r#"
            SELECT *, vector::similarity::cosine(embedding, $embedding) AS score
            FROM {corpus}
            WHERE embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take};
            "#
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let rows: Vec<ChunkHit> = response.take::<Vec<ChunkHit>>(0).unwrap_or_default();
        Ok(rows)
    }

    /// Fetches neighbours of a vector hit by shared `cluster_id`.
    pub async fn cluster_match(
        corpus: &str,
        cluster_id: i64,
        take: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let sql = format!(
            "SELECT * FROM {corpus} WHERE metadata.cluster_id = $cluster_id LIMIT $limit"
        );

        let mut response = db
            .query(&sql)
            .bind(("cluster_id", cluster_id))
            .bind(("limit", take as i64))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows)
    }

    /// Full corpus scan for the in-process lexical index. The vigente
    /// predicate is applied by the caller, which also holds the parent
    /// document statuses.
    pub async fn scan_all(corpus: &str, db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let sql = format!("SELECT * FROM {corpus}");
        let mut response = db.query(&sql).await?;
        let rows: Vec<Self> = response.take(0)?;
        Ok(rows)
    }

    /// Case-insensitive substring match over title and content.
    pub async fn filter_by_substring(
        corpus: &str,
        needle: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let sql = format!(
            "SELECT * FROM {corpus} \
             WHERE string::contains(string::lowercase(title), $needle) \
                OR string::contains(string::lowercase(content), $needle)"
        );

        let mut response = db
            .query(&sql)
            .bind(("needle", needle.to_lowercase()))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows)
    }
}

/// Processed chunk as produced by the ingest pipeline, serialized into the
/// per-document artifact file before insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedChunk {
    pub url: String,
    pub chunk_number: i64,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub document_id: Option<String>,
}

impl ProcessedChunk {
    pub fn into_stored(self) -> StoredChunk {
        StoredChunk::new(
            self.url,
            self.chunk_number,
            self.title,
            self.summary,
            self.content,
            self.metadata,
            self.embedding,
            self.document_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CORPUS: &str = "pd_test";

    fn chunk_with(
        title: &str,
        content: &str,
        cluster_id: i64,
        embedding: Vec<f32>,
    ) -> StoredChunk {
        let metadata = ChunkMetadata {
            chunk_size: content.len(),
            source: "test".into(),
            cluster_id,
            ..ChunkMetadata::default()
        };
        StoredChunk::new(
            "/docs/test.pdf".into(),
            0,
            title.into(),
            "resumen".into(),
            content.into(),
            metadata,
            embedding,
            None,
        )
    }

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized(TEST_CORPUS, 3)
            .await
            .expect("indexes");
        db
    }

    #[tokio::test]
    async fn vector_match_orders_by_similarity() {
        let db = test_db().await;

        chunk_with("uno", "primer fragmento", 0, vec![1.0, 0.0, 0.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert uno");
        chunk_with("dos", "segundo fragmento", 1, vec![0.0, 1.0, 0.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert dos");

        let hits = StoredChunk::vector_match(TEST_CORPUS, vec![0.0, 1.0, 0.0], 2, &db)
            .await
            .expect("vector match");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.title, "dos");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn cluster_match_filters_by_cluster_id() {
        let db = test_db().await;

        chunk_with("a", "contenido a", 7, vec![1.0, 0.0, 0.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert a");
        chunk_with("b", "contenido b", 7, vec![0.0, 1.0, 0.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert b");
        chunk_with("c", "contenido c", 9, vec![0.0, 0.0, 1.0])
            .insert(TEST_CORPUS, &db)
            .await
            .expect("insert c");

        let hits = StoredChunk::cluster_match(TEST_CORPUS, 7, 5, &db)
            .await
            .expect("cluster match");

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|chunk| chunk.metadata.cluster_id == 7));
    }

    #[tokio::test]
    async fn substring_filter_is_case_insensitive() {
        let db = test_db().await;

        chunk_with(
            "Artículo 3",
            "La LFPDPPP regula el tratamiento de datos.",
            0,
            vec![1.0, 0.0, 0.0],
        )
        .insert(TEST_CORPUS, &db)
        .await
        .expect("insert");

        let hits = StoredChunk::filter_by_substring(TEST_CORPUS, "lfpdppp", &db)
            .await
            .expect("filter");
        assert_eq!(hits.len(), 1);

        let misses = StoredChunk::filter_by_substring(TEST_CORPUS, "inexistente", &db)
            .await
            .expect("filter");
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn scan_all_returns_every_row() {
        let db = test_db().await;

        for i in 0..3 {
            chunk_with(&format!("chunk {i}"), "texto", i, vec![0.1, 0.2, 0.3])
                .insert(TEST_CORPUS, &db)
                .await
                .expect("insert");
        }

        let rows = StoredChunk::scan_all(TEST_CORPUS, &db).await.expect("scan");
        assert_eq!(rows.len(), 3);
    }
}
