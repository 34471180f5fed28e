use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dex_core::{value_at_path, Category, DocumentHeader, PersistedDocument, RunRecord};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::postgres::PgDocumentStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub removed: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldCondition {
    /// Textual equality, so `"3"` matches both `3` and `"3"`.
    Eq(String),
    Gte(f64),
    Lte(f64),
}

/// Condition on a dot-path inside a document's `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub path: String,
    pub condition: FieldCondition,
}

impl FieldFilter {
    pub fn matches(&self, value: &Value) -> bool {
        let Some(field) = value_at_path(value, &self.path) else {
            return false;
        };
        match &self.condition {
            FieldCondition::Eq(expected) => scalar_text(field).as_deref() == Some(expected.as_str()),
            FieldCondition::Gte(bound) => scalar_number(field).is_some_and(|n| n >= *bound),
            FieldCondition::Lte(bound) => scalar_number(field).is_some_and(|n| n <= *bound),
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One logical collection per category, plus the run ledger.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn collections(&self) -> Result<Vec<Category>, StoreError>;

    /// Every document in `category` with the value payload left out.
    async fn fetch_headers(&self, category: &Category) -> Result<Vec<DocumentHeader>, StoreError>;

    /// Removes documents whose canon appears in `documents`, then inserts `documents`.
    async fn replace_documents(
        &self,
        category: &Category,
        documents: &[PersistedDocument],
    ) -> Result<WriteResult, StoreError>;

    async fn fetch_all(&self, category: &Category) -> Result<Vec<PersistedDocument>, StoreError>;

    async fn find_by_key(
        &self,
        category: &Category,
        key: &str,
    ) -> Result<Option<PersistedDocument>, StoreError>;

    async fn find_matching(
        &self,
        category: &Category,
        fragment: &str,
    ) -> Result<Vec<PersistedDocument>, StoreError>;

    async fn search(
        &self,
        category: &Category,
        filters: &[FieldFilter],
    ) -> Result<Vec<PersistedDocument>, StoreError>;

    async fn find_created_in(
        &self,
        category: &Category,
        revision: &str,
    ) -> Result<Vec<PersistedDocument>, StoreError>;

    async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError>;

    async fn record_run(&self, run: &RunRecord) -> Result<(), StoreError>;
}

/// Process-local store, used for dry runs without a database and in tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<Category, BTreeMap<String, PersistedDocument>>>,
    runs: RwLock<Vec<RunRecord>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn filtered<F>(&self, category: &Category, keep: F) -> Vec<PersistedDocument>
    where
        F: Fn(&PersistedDocument) -> bool,
    {
        let collections = self.collections.read().await;
        collections
            .get(category)
            .map(|docs| docs.values().filter(|d| keep(d)).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn collections(&self) -> Result<Vec<Category>, StoreError> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn fetch_headers(&self, category: &Category) -> Result<Vec<DocumentHeader>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(category)
            .map(|docs| docs.values().map(PersistedDocument::header).collect())
            .unwrap_or_default())
    }

    async fn replace_documents(
        &self,
        category: &Category,
        documents: &[PersistedDocument],
    ) -> Result<WriteResult, StoreError> {
        if documents.is_empty() {
            return Ok(WriteResult::default());
        }
        let canons = documents
            .iter()
            .map(|d| d.canon.as_str())
            .collect::<BTreeSet<_>>();
        if canons.len() != documents.len() {
            return Err(StoreError::Message(format!(
                "duplicate canon in write batch for {category}"
            )));
        }

        let mut collections = self.collections.write().await;
        let docs = collections.entry(category.clone()).or_default();
        let before = docs.len();
        docs.retain(|canon, _| !canons.contains(canon.as_str()));
        let removed = before - docs.len();
        for doc in documents {
            docs.insert(doc.canon.clone(), doc.clone());
        }
        Ok(WriteResult {
            removed,
            inserted: documents.len(),
        })
    }

    async fn fetch_all(&self, category: &Category) -> Result<Vec<PersistedDocument>, StoreError> {
        Ok(self.filtered(category, |_| true).await)
    }

    async fn find_by_key(
        &self,
        category: &Category,
        key: &str,
    ) -> Result<Option<PersistedDocument>, StoreError> {
        let key = key.to_lowercase();
        Ok(self
            .filtered(category, |d| d.keys.iter().any(|k| *k == key))
            .await
            .into_iter()
            .next())
    }

    async fn find_matching(
        &self,
        category: &Category,
        fragment: &str,
    ) -> Result<Vec<PersistedDocument>, StoreError> {
        let fragment = fragment.to_lowercase();
        Ok(self
            .filtered(category, |d| d.keys.iter().any(|k| k.contains(&fragment)))
            .await)
    }

    async fn search(
        &self,
        category: &Category,
        filters: &[FieldFilter],
    ) -> Result<Vec<PersistedDocument>, StoreError> {
        Ok(self
            .filtered(category, |d| filters.iter().all(|f| f.matches(&d.value)))
            .await)
    }

    async fn find_created_in(
        &self,
        category: &Category,
        revision: &str,
    ) -> Result<Vec<PersistedDocument>, StoreError> {
        Ok(self
            .filtered(category, |d| d.meta.created == revision)
            .await)
    }

    async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .max_by_key(|r| r.epoch)
            .cloned())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        runs.retain(|r| r.epoch != run.epoch);
        runs.push(run.clone());
        Ok(())
    }
}

/// Connects to Postgres when a URL is given, otherwise returns an empty in-memory store.
pub async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match database_url {
        Some(url) => {
            let store = PgDocumentStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("document store: postgres");
            Ok(Arc::new(store))
        }
        None => {
            info!("document store: in-memory (nothing persists past this process)");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
    }
}
