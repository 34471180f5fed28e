use std::collections::{HashMap, HashSet};

use dex_core::{content_hash, Category, DocumentHeader, PreDocument};
use serde_json::Value;
use tracing::warn;

/// Metadata of a category's persisted documents, indexed by canon.
#[derive(Debug, Clone, Default)]
pub struct PriorSnapshot {
    by_canon: HashMap<String, DocumentHeader>,
}

impl PriorSnapshot {
    pub fn new(headers: Vec<DocumentHeader>) -> Self {
        Self {
            by_canon: headers.into_iter().map(|h| (h.canon.clone(), h)).collect(),
        }
    }

    pub fn get(&self, canon: &str) -> Option<&DocumentHeader> {
        self.by_canon.get(canon)
    }

    pub fn len(&self) -> usize {
        self.by_canon.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_canon.is_empty()
    }
}

/// A pre-document that is new or whose content hash moved since the prior run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedDocument {
    pub canon: String,
    pub keys: Vec<String>,
    pub value: Value,
    pub hash: String,
    pub is_new: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub found: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Canons seen more than once in the batch; only the first occurrence is kept.
    pub duplicates: Vec<String>,
    /// Pre-documents dropped because they carried no keys at all.
    pub keyless: usize,
    pub changed: Vec<ChangedDocument>,
}

pub fn diff(category: &Category, documents: Vec<PreDocument>, prior: &PriorSnapshot) -> DiffOutcome {
    let mut outcome = DiffOutcome {
        found: documents.len(),
        ..DiffOutcome::default()
    };
    let mut seen = HashSet::with_capacity(documents.len());

    for doc in documents {
        let Some(canon) = doc.canon().map(str::to_string) else {
            warn!(%category, "dropping document without keys");
            outcome.keyless += 1;
            continue;
        };
        if !seen.insert(canon.clone()) {
            warn!(%category, %canon, "duplicate canon in batch, keeping first occurrence");
            outcome.duplicates.push(canon);
            continue;
        }

        let keys = doc.lowercased_keys();
        let hash = content_hash(&keys, &doc.value);
        let is_new = match prior.get(&canon) {
            None => true,
            Some(previous) if previous.meta.hash != hash => false,
            Some(_) => {
                outcome.unchanged += 1;
                continue;
            }
        };
        if is_new {
            outcome.new += 1;
        } else {
            outcome.updated += 1;
        }
        outcome.changed.push(ChangedDocument {
            canon,
            keys,
            value: doc.value,
            hash,
            is_new,
        });
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use dex_core::DocumentMeta;
    use serde_json::json;

    fn header(canon: &str, keys: &[&str], value: &Value) -> DocumentHeader {
        let keys = keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
        DocumentHeader {
            canon: canon.to_string(),
            meta: DocumentMeta {
                hash: content_hash(&keys, value),
                created: "r1".into(),
                updated: "r1".into(),
                created_index: 1,
                updated_index: 1,
                date: 0,
            },
            keys,
        }
    }

    #[test]
    fn unchanged_documents_are_dropped() {
        let value = json!({"id": "a1", "name": "Rook"});
        let prior = PriorSnapshot::new(vec![header("a1", &["a1", "rook"], &value)]);
        let out = diff(
            &Category::from("operator"),
            vec![PreDocument::new(["a1", "Rook"], value)],
            &prior,
        );
        assert!(out.changed.is_empty());
        assert_eq!((out.found, out.unchanged), (1, 1));
    }

    #[test]
    fn type_drift_alone_is_not_a_change() {
        let prior_value = json!({"rarity": 5, "elite": true});
        let prior = PriorSnapshot::new(vec![header("a1", &["a1"], &prior_value)]);
        let out = diff(
            &Category::from("operator"),
            vec![PreDocument::new(["a1"], json!({"rarity": "5", "elite": "true"}))],
            &prior,
        );
        assert_eq!(out.unchanged, 1);
    }

    #[test]
    fn new_and_updated_are_told_apart() {
        let prior = PriorSnapshot::new(vec![header("a1", &["a1", "rook"], &json!({"name": "Rook"}))]);
        let out = diff(
            &Category::from("operator"),
            vec![
                PreDocument::new(["a1", "Rook2"], json!({"name": "Rook2"})),
                PreDocument::new(["b2", "Pawn"], json!({"name": "Pawn"})),
            ],
            &prior,
        );
        assert_eq!((out.new, out.updated), (1, 1));
        let updated = out.changed.iter().find(|c| c.canon == "a1").unwrap();
        assert!(!updated.is_new);
        assert_eq!(updated.keys, vec!["a1", "rook2"]);
    }

    #[test]
    fn duplicate_canons_keep_the_first_occurrence() {
        let out = diff(
            &Category::from("operator"),
            vec![
                PreDocument::new(["a1"], json!(1)),
                PreDocument::new(["a1"], json!(2)),
                PreDocument::new(Vec::<String>::new(), json!(3)),
            ],
            &PriorSnapshot::default(),
        );
        assert_eq!(out.changed.len(), 1);
        assert_eq!(out.changed[0].value, json!(1));
        assert_eq!(out.duplicates, vec!["a1"]);
        assert_eq!(out.keyless, 1);
        assert_eq!(out.found, 3);
    }

    #[test]
    fn canon_keeps_display_case() {
        let out = diff(
            &Category::from("define"),
            vec![PreDocument::new(["BA.Poison", "Poison"], json!({}))],
            &PriorSnapshot::default(),
        );
        assert_eq!(out.changed[0].canon, "BA.Poison");
        assert_eq!(out.changed[0].keys, vec!["ba.poison", "poison"]);
    }
}
