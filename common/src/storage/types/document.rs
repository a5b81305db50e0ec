use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(RegulatoryDocument, "regulatory_document", {
    document_type: String,
    document_title: String,
    issuing_authority: Option<String>,
    publication_date: Option<String>,
    effective_date: Option<String>,
    jurisdiction: Option<String>,
    status: Option<String>,
    document_number: Option<String>,
    official_source: Option<String>,
    original_url: Option<String>,
    metadata: serde_json::Value
});

impl RegulatoryDocument {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_type: String,
        document_title: String,
        issuing_authority: Option<String>,
        publication_date: Option<String>,
        effective_date: Option<String>,
        jurisdiction: Option<String>,
        status: Option<String>,
        document_number: Option<String>,
        official_source: Option<String>,
        original_url: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<Self, AppError> {
        if document_title.trim().is_empty() {
            return Err(AppError::Validation(
                "document_title must be non-empty".into(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_type,
            document_title,
            issuing_authority,
            publication_date,
            effective_date,
            jurisdiction,
            status,
            document_number,
            official_source,
            original_url,
            metadata,
        })
    }

    /// Loads the status column for a set of documents in one query. Used by
    /// the lexical search to apply the vigente predicate.
    pub async fn statuses_by_id(
        ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<std::collections::HashMap<String, Option<String>>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            status: Option<String>,
        }

        if ids.is_empty() {
            return Ok(std::collections::HashMap::new());
        }

        let things: Vec<surrealdb::sql::Thing> = ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let mut response = db
            .query("SELECT id, status FROM type::table($table) WHERE id IN $things")
            .bind(("table", Self::table_name().to_owned()))
            .bind(("things", things))
            .await?;

        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().map(|row| (row.id, row.status)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> RegulatoryDocument {
        RegulatoryDocument::new(
            "Ley".into(),
            "Ley de Protección de Datos Personales".into(),
            Some("Congreso de la República".into()),
            Some("2011-07-03".into()),
            None,
            Some("Perú".into()),
            Some("vigente".into()),
            Some("29733".into()),
            Some("El Peruano".into()),
            Some("/docs/ley_29733.pdf".into()),
            serde_json::json!({"file_name": "ley_29733.pdf"}),
        )
        .expect("valid document")
    }

    #[test]
    fn rejects_empty_title() {
        let result = RegulatoryDocument::new(
            "Ley".into(),
            "   ".into(),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            serde_json::Value::Null,
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn stores_and_reads_back() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let doc = sample_document();
        db.store_item(doc.clone()).await.expect("store document");

        let loaded: Option<RegulatoryDocument> =
            db.get_item(&doc.id).await.expect("load document");
        let loaded = loaded.expect("document present");
        assert_eq!(loaded.document_title, doc.document_title);
        assert_eq!(loaded.status.as_deref(), Some("vigente"));
    }

    #[tokio::test]
    async fn statuses_by_id_returns_map() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let doc = sample_document();
        db.store_item(doc.clone()).await.expect("store document");

        let statuses = RegulatoryDocument::statuses_by_id(&[doc.id.clone()], &db)
            .await
            .expect("status query");
        assert_eq!(
            statuses.get(&doc.id).cloned().flatten().as_deref(),
            Some("vigente")
        );
    }
}
