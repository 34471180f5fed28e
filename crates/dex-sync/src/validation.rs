use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use dex_core::{value_at_path, PersistedDocument};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a schema failure stops the category's write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    #[default]
    Advisory,
    Blocking,
}

impl FromStr for ValidationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(Self::Advisory),
            "blocking" => Ok(Self::Blocking),
            other => Err(format!("unknown validation policy `{other}` (expected advisory|blocking)")),
        }
    }
}

impl fmt::Display for ValidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Advisory => "advisory",
            Self::Blocking => "blocking",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::String, Value::String(_))
                | (Self::Number, Value::Number(_))
                | (Self::Boolean, Value::Bool(_))
                | (Self::Object, Value::Object(_))
                | (Self::Array, Value::Array(_))
                | (Self::Null, Value::Null)
        )
    }
}

/// Per-category document shape, read from `<schema_dir>/<category>.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub types: BTreeMap<String, FieldType>,
}

impl FieldSchema {
    pub fn check(&self, value: &Value) -> Result<(), String> {
        for path in &self.required {
            if value_at_path(value, path).is_none() {
                return Err(format!("missing required field `{path}`"));
            }
        }
        for (path, expected) in &self.types {
            if let Some(field) = value_at_path(value, path) {
                if !expected.matches(field) {
                    return Err(format!("field `{path}` is not of type {expected:?}"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    schemas: BTreeMap<String, FieldSchema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.yaml` in `dir`; a missing directory means no schemas.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut set = Self::new();
        if !dir.is_dir() {
            return Ok(set);
        }
        let entries = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let path = entry.with_context(|| format!("reading {}", dir.display()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(category) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let schema: FieldSchema = serde_yaml::from_str(
                &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
            )
            .with_context(|| format!("parsing {}", path.display()))?;
            set.insert(category, schema);
        }
        Ok(set)
    }

    pub fn insert(&mut self, category: impl Into<String>, schema: FieldSchema) {
        self.schemas.insert(category.into(), schema);
    }

    pub fn get(&self, category: &str) -> Option<&FieldSchema> {
        self.schemas.get(category)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub canon: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// False when the category has no schema.
    pub checked: bool,
    /// First failing document; later ones are not examined.
    pub failure: Option<ValidationFailure>,
}

pub fn validate(schema: Option<&FieldSchema>, documents: &[PersistedDocument]) -> ValidationReport {
    let Some(schema) = schema else {
        return ValidationReport::default();
    };
    let failure = documents.iter().find_map(|doc| {
        schema.check(&doc.value).err().map(|detail| ValidationFailure {
            canon: doc.canon.clone(),
            detail,
        })
    });
    ValidationReport {
        checked: true,
        failure,
    }
}
