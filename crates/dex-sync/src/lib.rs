//! Incremental sync: resolve category order, run extraction stages, diff against
//! the persisted snapshot, stamp versions, validate and write.

use std::path::PathBuf;

use dex_stages::StageError;
use dex_storage::{FetchError, StoreError};
use thiserror::Error;

pub mod config;
pub mod differ;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod revision;
pub mod runner;
pub mod validation;
pub mod versioning;
pub mod writer;

pub use config::SyncConfig;
pub use differ::{diff, ChangedDocument, DiffOutcome, PriorSnapshot};
pub use pipeline::{RunOptions, SyncPipeline, SyncRunSummary};
pub use report::{CategoryReport, RunFailure, SyncReport};
pub use resolver::{DependencyGraph, ResolveError};
pub use runner::{StageOutput, StageRunner};
pub use validation::{FieldSchema, SchemaSet, ValidationFailure, ValidationPolicy, ValidationReport};
pub use writer::SyncWriter;

pub const CRATE_NAME: &str = "dex-sync";

/// A run-fatal failure. Categories finished before it keep their writes.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("category {category}: fetch failed")]
    Fetch {
        category: String,
        #[source]
        source: FetchError,
    },
    #[error("category {category}: extraction failed")]
    Stage {
        category: String,
        #[source]
        source: StageError,
    },
    #[error("category {category}: document store failed")]
    Store {
        category: String,
        #[source]
        source: StoreError,
    },
    #[error("category {category}: document {canon} failed validation: {detail}")]
    Validation {
        category: String,
        canon: String,
        detail: String,
    },
    #[error("epoch {requested} is not after the latest recorded epoch {latest}")]
    StaleEpoch { requested: i64, latest: i64 },
    #[error("run ledger unavailable")]
    Ledger(#[source] StoreError),
    #[error("writing run report under {}", .path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn category(&self) -> Option<&str> {
        match self {
            Self::Fetch { category, .. }
            | Self::Stage { category, .. }
            | Self::Store { category, .. }
            | Self::Validation { category, .. } => Some(category),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_failing_category() {
        let err = SyncError::Stage {
            category: "operator".into(),
            source: StageError::MissingArtifact("excel/character_table.json".into()),
        };
        assert_eq!(err.category(), Some("operator"));
        assert_eq!(err.to_string(), "category operator: extraction failed");
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("excel/character_table.json"));
    }
}
