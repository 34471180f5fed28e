use std::sync::Arc;

use dex_core::{Category, PersistedDocument};
use dex_storage::{DocumentStore, StoreError, WriteResult};
use tracing::info;

/// Replaces persisted state for the touched canons, or only reports what it
/// would write when the run is not committing.
#[derive(Clone)]
pub struct SyncWriter {
    store: Arc<dyn DocumentStore>,
    commit: bool,
}

impl SyncWriter {
    pub fn new(store: Arc<dyn DocumentStore>, commit: bool) -> Self {
        Self { store, commit }
    }

    pub fn commits(&self) -> bool {
        self.commit
    }

    pub async fn sync(
        &self,
        category: &Category,
        documents: &[PersistedDocument],
    ) -> Result<WriteResult, StoreError> {
        if documents.is_empty() {
            return Ok(WriteResult::default());
        }
        if !self.commit {
            info!(%category, "would have written {} documents", documents.len());
            return Ok(WriteResult::default());
        }
        info!(%category, "writing {} documents", documents.len());
        self.store.replace_documents(category, documents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dex_core::DocumentMeta;
    use dex_storage::MemoryDocumentStore;
    use serde_json::json;

    fn doc(canon: &str) -> PersistedDocument {
        PersistedDocument {
            canon: canon.into(),
            keys: vec![canon.into()],
            value: json!({}),
            meta: DocumentMeta {
                hash: "h".into(),
                created: "r1".into(),
                updated: "r1".into(),
                created_index: 1,
                updated_index: 1,
                date: 0,
            },
        }
    }

    #[tokio::test]
    async fn dry_run_leaves_the_store_untouched() {
        let store = Arc::new(MemoryDocumentStore::new());
        let writer = SyncWriter::new(store.clone(), false);
        let result = writer.sync(&Category::from("range"), &[doc("1-1")]).await.unwrap();
        assert_eq!(result, WriteResult::default());
        assert!(store.collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_replaces_documents() {
        let store = Arc::new(MemoryDocumentStore::new());
        let writer = SyncWriter::new(store.clone(), true);
        let cat = Category::from("range");
        writer.sync(&cat, &[doc("1-1")]).await.unwrap();
        let result = writer.sync(&cat, &[doc("1-1"), doc("2-1")]).await.unwrap();
        assert_eq!(result, WriteResult { removed: 1, inserted: 2 });
        assert_eq!(store.fetch_all(&cat).await.unwrap().len(), 2);
    }
}
