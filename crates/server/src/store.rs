use crate::error::AppError;
use crate::models::DEFAULT_PARTITION_KEY;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;

/// A record persisted in the document store.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const CONTAINER: &'static str;

    fn doc_id(&self) -> &str;
}

/// Keyed document persistence. Absence is modelled as `None` rather than an
/// error so callers can branch on first-write-vs-replay without matching on
/// store-specific error codes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch_raw(&self, container: &str, id: &str) -> Result<Option<Value>, AppError>;

    async fn upsert_raw(&self, container: &str, id: &str, body: Value) -> Result<(), AppError>;
}

impl<'a> dyn DocumentStore + 'a {
    pub async fn fetch<T: Document>(&self, id: &str) -> Result<Option<T>, AppError> {
        match self.fetch_raw(T::CONTAINER, id).await? {
            Some(body) => {
                let doc = serde_json::from_value(body).map_err(|e| {
                    AppError::Internal(format!(
                        "malformed document in container {}: {e}",
                        T::CONTAINER
                    ))
                })?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    pub async fn upsert<T: Document>(&self, doc: &T) -> Result<(), AppError> {
        let body = serde_json::to_value(doc)
            .map_err(|e| AppError::Internal(format!("failed to serialize document: {e}")))?;
        self.upsert_raw(T::CONTAINER, doc.doc_id(), body).await
    }
}

/// Postgres-backed store: one JSONB table keyed by (container, id).
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn fetch_raw(&self, container: &str, id: &str) -> Result<Option<Value>, AppError> {
        let body: Option<Value> =
            sqlx::query_scalar("SELECT body FROM documents WHERE container = $1 AND id = $2")
                .bind(container)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(body)
    }

    async fn upsert_raw(&self, container: &str, id: &str, body: Value) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO documents (container, id, partition_key, body) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (container, id) \
             DO UPDATE SET body = EXCLUDED.body, updated_at = now()",
        )
        .bind(container)
        .bind(id)
        .bind(DEFAULT_PARTITION_KEY)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(test)]
pub struct MemDocumentStore {
    docs: tokio::sync::RwLock<std::collections::HashMap<(String, String), Value>>,
}

#[cfg(test)]
impl MemDocumentStore {
    pub fn new() -> Self {
        Self {
            docs: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn len(&self, container: &str) -> usize {
        self.docs
            .read()
            .await
            .keys()
            .filter(|(c, _)| c == container)
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl DocumentStore for MemDocumentStore {
    async fn fetch_raw(&self, container: &str, id: &str) -> Result<Option<Value>, AppError> {
        let docs = self.docs.read().await;
        Ok(docs.get(&(container.to_string(), id.to_string())).cloned())
    }

    async fn upsert_raw(&self, container: &str, id: &str, body: Value) -> Result<(), AppError> {
        let mut docs = self.docs.write().await;
        docs.insert((container.to_string(), id.to_string()), body);
        Ok(())
    }
}
