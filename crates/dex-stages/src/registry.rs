use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::StageError;

/// Entries a stage wants published under its own category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryUpdate {
    entries: BTreeMap<String, Value>,
}

impl RegistryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, record: Value) {
        self.entries.insert(id.into(), record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Value)> for RegistryUpdate {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Run-scoped map of category -> record id -> resolved record.
///
/// Stages only ever see `&LookupRegistry`; the runner owns the registry and is
/// the single writer, publishing each category exactly once.
#[derive(Debug, Default)]
pub struct LookupRegistry {
    entries: HashMap<String, BTreeMap<String, Value>>,
}

impl LookupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_populated(&self, category: &str) -> bool {
        self.entries.contains_key(category)
    }

    pub fn entry(&self, category: &str) -> Option<&BTreeMap<String, Value>> {
        self.entries.get(category)
    }

    pub fn get(&self, category: &str, id: &str) -> Option<&Value> {
        self.entries.get(category).and_then(|e| e.get(id))
    }

    /// A missing reference resolves to `null`: absence is data, not failure.
    pub fn resolve(&self, category: &str, id: &str) -> Value {
        self.get(category, id).cloned().unwrap_or(Value::Null)
    }

    /// First hit for `id` across `categories`, in order.
    pub fn resolve_in(&self, categories: &[&str], id: &str) -> Value {
        categories
            .iter()
            .find_map(|c| self.get(c, id))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn publish(&mut self, category: &str, update: RegistryUpdate) -> Result<(), StageError> {
        if self.entries.contains_key(category) {
            return Err(StageError::RegistryRewrite(category.to_string()));
        }
        self.entries.insert(category.to_string(), update.entries);
        Ok(())
    }
}
