//! Extraction stage contract, run-scoped lookup registry and the built-in stage catalog.

use std::collections::BTreeMap;
use std::fmt;

use dex_core::PreDocument;
use serde_json::Value;
use thiserror::Error;

mod campaign;
mod catalog;
mod registry;

pub use catalog::{catalog, stage_for};
pub use registry::{LookupRegistry, RegistryUpdate};

pub const CRATE_NAME: &str = "dex-stages";

/// Which dataset an artifact is read from. The secondary locale has no local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Locale {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactRef {
    pub locale: Locale,
    pub path: String,
}

impl ArtifactRef {
    pub fn primary(path: impl Into<String>) -> Self {
        Self {
            locale: Locale::Primary,
            path: path.into(),
        }
    }

    pub fn secondary(path: impl Into<String>) -> Self {
        Self {
            locale: Locale::Secondary,
            path: path.into(),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locale {
            Locale::Primary => f.write_str(&self.path),
            Locale::Secondary => write!(f, "secondary:{}", self.path),
        }
    }
}

/// Parsed artifacts handed to a stage, keyed by reference.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    items: BTreeMap<ArtifactRef, Value>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, artifact: ArtifactRef, value: Value) {
        self.items.insert(artifact, value);
    }

    pub fn contains(&self, artifact: &ArtifactRef) -> bool {
        self.items.contains_key(artifact)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, artifact: &ArtifactRef) -> Result<&Value, StageError> {
        self.items
            .get(artifact)
            .ok_or_else(|| StageError::MissingArtifact(artifact.to_string()))
    }

    pub fn primary(&self, path: &str) -> Result<&Value, StageError> {
        self.get(&ArtifactRef::primary(path))
    }

    pub fn secondary(&self, path: &str) -> Result<&Value, StageError> {
        self.get(&ArtifactRef::secondary(path))
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("artifact {0} was not fetched for this stage")]
    MissingArtifact(String),
    #[error("unexpected shape in {artifact}: {detail}")]
    Shape { artifact: String, detail: String },
    #[error("lookup registry entry for {0} is already populated")]
    RegistryRewrite(String),
}

impl StageError {
    pub fn shape(artifact: &str, detail: impl Into<String>) -> Self {
        Self::Shape {
            artifact: artifact.to_string(),
            detail: detail.into(),
        }
    }
}

/// What one stage produced: documents for its own collection, plus the lookup
/// entries later stages join against.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub documents: Vec<PreDocument>,
    pub registry: Option<RegistryUpdate>,
}

/// One category's extraction routine.
///
/// `extract` must be a pure function of the artifacts and the registry so that
/// repeated runs over unchanged data produce identical documents.
pub trait Stage: Send + Sync {
    fn category(&self) -> &'static str;

    /// Categories whose registry entries this stage reads.
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    fn artifacts(&self) -> Vec<ArtifactRef>;

    /// Artifacts whose paths are only known once the first batch is parsed.
    fn follow_ups(
        &self,
        _fetched: &ArtifactSet,
        _registry: &LookupRegistry,
    ) -> Result<Vec<ArtifactRef>, StageError> {
        Ok(Vec::new())
    }

    fn extract(
        &self,
        artifacts: &ArtifactSet,
        registry: &LookupRegistry,
    ) -> Result<Extraction, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_artifacts_are_reported_by_reference() {
        let mut set = ArtifactSet::new();
        set.insert(ArtifactRef::primary("excel/range_table.json"), json!({}));
        assert!(set.primary("excel/range_table.json").is_ok());
        let err = set.secondary("excel/range_table.json").unwrap_err();
        assert_eq!(
            err.to_string(),
            "artifact secondary:excel/range_table.json was not fetched for this stage"
        );
    }
}
