use async_trait::async_trait;
use dex_core::{Category, DocumentHeader, DocumentMeta, PersistedDocument, RunRecord};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::store::{DocumentStore, FieldCondition, FieldFilter, StoreError, WriteResult};

// Five binds per row keeps each statement well under the protocol's bind limit.
const INSERT_CHUNK: usize = 1000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        category TEXT NOT NULL,
        canon TEXT NOT NULL,
        keys TEXT[] NOT NULL,
        value JSONB NOT NULL,
        meta JSONB NOT NULL,
        PRIMARY KEY (category, canon)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS documents_keys_idx ON documents USING GIN (keys)",
    "CREATE INDEX IF NOT EXISTS documents_created_idx ON documents ((meta->>'created'))",
    r#"
    CREATE TABLE IF NOT EXISTS sync_runs (
        epoch BIGINT PRIMARY KEY,
        revision TEXT NOT NULL,
        message TEXT,
        date BIGINT NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn row_to_document(row: &PgRow) -> Result<PersistedDocument, StoreError> {
    let meta: serde_json::Value = row.try_get("meta")?;
    Ok(PersistedDocument {
        canon: row.try_get("canon")?,
        keys: row.try_get("keys")?,
        value: row.try_get("value")?,
        meta: serde_json::from_value::<DocumentMeta>(meta)?,
    })
}

fn rows_to_documents(rows: &[PgRow]) -> Result<Vec<PersistedDocument>, StoreError> {
    rows.iter().map(row_to_document).collect()
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn collections(&self) -> Result<Vec<Category>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT category FROM documents ORDER BY category")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Category::new(row.try_get::<String, _>("category")?));
        }
        Ok(out)
    }

    async fn fetch_headers(&self, category: &Category) -> Result<Vec<DocumentHeader>, StoreError> {
        let rows = sqlx::query("SELECT canon, keys, meta FROM documents WHERE category = $1")
            .bind(category.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let meta: serde_json::Value = row.try_get("meta")?;
            out.push(DocumentHeader {
                canon: row.try_get("canon")?,
                keys: row.try_get("keys")?,
                meta: serde_json::from_value(meta)?,
            });
        }
        Ok(out)
    }

    async fn replace_documents(
        &self,
        category: &Category,
        documents: &[PersistedDocument],
    ) -> Result<WriteResult, StoreError> {
        if documents.is_empty() {
            return Ok(WriteResult::default());
        }
        let canons = documents.iter().map(|d| d.canon.clone()).collect::<Vec<_>>();

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM documents WHERE category = $1 AND canon = ANY($2)")
            .bind(category.as_str())
            .bind(&canons)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for chunk in documents.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO documents (category, canon, keys, value, meta) ");
            let mut encoded = Vec::with_capacity(chunk.len());
            for doc in chunk {
                encoded.push((doc, serde_json::to_value(&doc.meta)?));
            }
            builder.push_values(encoded, |mut b, (doc, meta)| {
                b.push_bind(category.as_str())
                    .push_bind(&doc.canon)
                    .push_bind(&doc.keys)
                    .push_bind(&doc.value)
                    .push_bind(meta);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(%category, removed, inserted = documents.len(), "replaced documents");
        Ok(WriteResult {
            removed: removed as usize,
            inserted: documents.len(),
        })
    }

    async fn fetch_all(&self, category: &Category) -> Result<Vec<PersistedDocument>, StoreError> {
        let rows = sqlx::query(
            "SELECT canon, keys, value, meta FROM documents WHERE category = $1 ORDER BY canon",
        )
        .bind(category.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows_to_documents(&rows)
    }

    async fn find_by_key(
        &self,
        category: &Category,
        key: &str,
    ) -> Result<Option<PersistedDocument>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT canon, keys, value, meta
              FROM documents
             WHERE category = $1
               AND $2 = ANY(keys)
             ORDER BY canon
             LIMIT 1
            "#,
        )
        .bind(category.as_str())
        .bind(key.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_matching(
        &self,
        category: &Category,
        fragment: &str,
    ) -> Result<Vec<PersistedDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT canon, keys, value, meta
              FROM documents
             WHERE category = $1
               AND EXISTS (SELECT 1 FROM unnest(keys) AS k WHERE strpos(k, $2) > 0)
             ORDER BY canon
            "#,
        )
        .bind(category.as_str())
        .bind(fragment.to_lowercase())
        .fetch_all(&self.pool)
        .await?;
        rows_to_documents(&rows)
    }

    async fn search(
        &self,
        category: &Category,
        filters: &[FieldFilter],
    ) -> Result<Vec<PersistedDocument>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT canon, keys, value, meta FROM documents WHERE category = ");
        builder.push_bind(category.as_str());
        for filter in filters {
            let path = path_segments(&filter.path);
            match &filter.condition {
                FieldCondition::Eq(expected) => {
                    builder.push(" AND (value #>> ");
                    builder.push_bind(path);
                    builder.push(") = ");
                    builder.push_bind(expected.clone());
                }
                FieldCondition::Gte(bound) | FieldCondition::Lte(bound) => {
                    let op = if matches!(filter.condition, FieldCondition::Gte(_)) {
                        ">="
                    } else {
                        "<="
                    };
                    builder.push(" AND (CASE WHEN (value #>> ");
                    builder.push_bind(path.clone());
                    builder.push(r") ~ '^\s*-?[0-9]+(\.[0-9]+)?\s*$' THEN (value #>> ");
                    builder.push_bind(path);
                    builder.push(")::double precision END) ");
                    builder.push(op);
                    builder.push(" ");
                    builder.push_bind(*bound);
                }
            }
        }
        builder.push(" ORDER BY canon");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows_to_documents(&rows)
    }

    async fn find_created_in(
        &self,
        category: &Category,
        revision: &str,
    ) -> Result<Vec<PersistedDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT canon, keys, value, meta
              FROM documents
             WHERE category = $1
               AND meta->>'created' = $2
             ORDER BY canon
            "#,
        )
        .bind(category.as_str())
        .bind(revision)
        .fetch_all(&self.pool)
        .await?;
        rows_to_documents(&rows)
    }

    async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT epoch, revision, message, date FROM sync_runs ORDER BY epoch DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(RunRecord {
            epoch: row.try_get("epoch")?,
            revision: row.try_get("revision")?,
            message: row.try_get("message")?,
            date: row.try_get("date")?,
        }))
    }

    async fn record_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (epoch, revision, message, date)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (epoch) DO UPDATE
               SET revision = EXCLUDED.revision,
                   message = EXCLUDED.message,
                   date = EXCLUDED.date
            "#,
        )
        .bind(run.epoch)
        .bind(&run.revision)
        .bind(&run.message)
        .bind(run.date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_paths_become_text_arrays() {
        assert_eq!(path_segments("data.rarity"), vec!["data", "rarity"]);
    }

    #[test]
    fn schema_declares_canon_uniqueness_per_category() {
        assert!(SCHEMA[0].contains("PRIMARY KEY (category, canon)"));
    }
}
