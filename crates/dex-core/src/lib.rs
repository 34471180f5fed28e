//! Core document model, run stamps and content hashing for dexsync.

use std::borrow::Borrow;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "dex-core";

/// Name of an entity category; one persisted collection per category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for Category {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Extraction output before identity and version stamping.
///
/// `keys[0]` is the canonical key in display case; the rest are aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreDocument {
    pub keys: Vec<String>,
    pub value: Value,
}

impl PreDocument {
    pub fn new<I, S>(keys: I, value: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            value,
        }
    }

    pub fn canon(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    /// Lowercased keys in original order. Repeats are kept: they are part of
    /// the stored key list and of the content hash.
    pub fn lowercased_keys(&self) -> Vec<String> {
        lowercase_keys(&self.keys)
    }
}

pub fn lowercase_keys(keys: &[String]) -> Vec<String> {
    keys.iter().map(|key| key.to_lowercase()).collect()
}

/// Version and content metadata stored alongside every document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub hash: String,
    pub created: String,
    pub updated: String,
    pub created_index: i64,
    pub updated_index: i64,
    pub date: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub canon: String,
    pub keys: Vec<String>,
    pub value: Value,
    pub meta: DocumentMeta,
}

impl PersistedDocument {
    pub fn header(&self) -> DocumentHeader {
        DocumentHeader {
            canon: self.canon.clone(),
            keys: self.keys.clone(),
            meta: self.meta.clone(),
        }
    }
}

/// A persisted document with its value payload left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub canon: String,
    pub keys: Vec<String>,
    pub meta: DocumentMeta,
}

/// Identifies one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStamp {
    pub epoch: i64,
    pub revision: String,
    pub date: i64,
}

impl RunStamp {
    pub fn new(epoch: i64, revision: impl Into<String>, date: i64) -> Self {
        Self {
            epoch,
            revision: revision.into(),
            date,
        }
    }

    pub fn now(epoch: i64, revision: impl Into<String>) -> Self {
        Self::new(epoch, revision, Utc::now().timestamp())
    }
}

/// One row of the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub epoch: i64,
    pub revision: String,
    pub message: Option<String>,
    pub date: i64,
}

/// Structural hash over lowercased keys and value.
///
/// Scalars are hashed by their textual form, with strings that read as JSON
/// numbers normalized the same way as numbers: `1`, `1.0`, `"1"` and `"1.0"`
/// all collide, as do `true` and `"true"`. Object member order is irrelevant; array order is
/// significant. `null` stays distinct from the string `"null"`.
pub fn content_hash(lowercased_keys: &[String], value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"keys");
    hasher.update(format!("a{}[", lowercased_keys.len()).as_bytes());
    for key in lowercased_keys {
        write_scalar(&mut hasher, key);
    }
    hasher.update(b"]value");
    write_canonical(&mut hasher, value);
    hex::encode(hasher.finalize())
}

fn write_scalar(hasher: &mut Sha256, text: &str) {
    hasher.update(format!("s{}:", text.len()).as_bytes());
    hasher.update(text.as_bytes());
}

fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n;"),
        Value::Bool(b) => write_scalar(hasher, if *b { "true" } else { "false" }),
        Value::Number(n) => write_scalar(hasher, &normalize_number(n)),
        Value::String(s) => match numeric_text(s) {
            Some(normalized) => write_scalar(hasher, &normalized),
            None => write_scalar(hasher, s),
        },
        Value::Array(items) => {
            hasher.update(format!("a{}[", items.len()).as_bytes());
            for item in items {
                write_canonical(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            hasher.update(format!("o{}{{", entries.len()).as_bytes());
            for (key, item) in entries {
                write_scalar(hasher, key);
                write_canonical(hasher, item);
            }
            hasher.update(b"}");
        }
    }
}

fn normalize_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// `Some` only for strings in strict JSON number syntax, so `"007"`, `"+1"`
/// and `" 1"` keep hashing as text.
fn numeric_text(s: &str) -> Option<String> {
    if s.is_empty() || s.trim() != s {
        return None;
    }
    serde_json::from_str::<serde_json::Number>(s)
        .ok()
        .map(|n| normalize_number(&n))
}

/// Looks up a dot-separated path (`data.rarity`, `skills.0.id`) inside a value.
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let value = json!({"id": "a1", "name": "Rook", "stats": [1, 2, 3]});
        let a = content_hash(&keys(&["a1", "rook"]), &value);
        let b = content_hash(&keys(&["a1", "rook"]), &value);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_ignores_primitive_type_drift() {
        let numeric = json!({"rarity": 1, "elite": true, "cost": 10.0});
        let stringly = json!({"rarity": "1", "elite": "true", "cost": "10"});
        let k = keys(&["a1"]);
        assert_eq!(content_hash(&k, &numeric), content_hash(&k, &stringly));
    }

    #[test]
    fn hash_ignores_member_order_but_not_array_order() {
        let k = keys(&["a1"]);
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(content_hash(&k, &a), content_hash(&k, &b));

        let c = json!([1, 2]);
        let d = json!([2, 1]);
        assert_ne!(content_hash(&k, &c), content_hash(&k, &d));
    }

    #[test]
    fn hash_distinguishes_null_and_keys() {
        let k = keys(&["a1"]);
        assert_ne!(
            content_hash(&k, &json!({"v": null})),
            content_hash(&k, &json!({"v": "null"}))
        );
        assert_ne!(
            content_hash(&keys(&["a1"]), &json!(1)),
            content_hash(&keys(&["a1", "rook"]), &json!(1))
        );
    }

    #[test]
    fn lowercased_keys_keep_order_and_repeats() {
        let doc = PreDocument::new(["A1", "Rook", "rook", "ROOK alter"], Value::Null);
        assert_eq!(doc.canon(), Some("A1"));
        assert_eq!(doc.lowercased_keys(), keys(&["a1", "rook", "rook", "rook alter"]));
        assert_ne!(
            content_hash(&doc.lowercased_keys(), &doc.value),
            content_hash(&keys(&["a1", "rook", "rook alter"]), &doc.value)
        );
    }

    #[test]
    fn numeric_strings_hash_like_numbers() {
        let k = keys(&["a1"]);
        for (text, number) in [("1.0", json!(1.0)), ("1.5", json!(1.5)), ("-2", json!(-2)), ("1e3", json!(1000))] {
            assert_eq!(
                content_hash(&k, &json!({ "v": text })),
                content_hash(&k, &json!({ "v": number })),
                "{text}"
            );
        }
        assert_eq!(content_hash(&k, &json!("1")), content_hash(&k, &json!("1.0")));
        for text in ["007", "+1", " 1", "1.5x"] {
            assert_ne!(content_hash(&k, &json!(text)), content_hash(&k, &json!(1)), "{text}");
        }
    }

    #[test]
    fn meta_serializes_camel_case_indexes() {
        let meta = DocumentMeta {
            hash: "h".into(),
            created: "r1".into(),
            updated: "r3".into(),
            created_index: 1,
            updated_index: 3,
            date: 0,
        };
        let text = serde_json::to_value(&meta).unwrap();
        assert_eq!(text["createdIndex"], json!(1));
        assert_eq!(text["updatedIndex"], json!(3));
    }

    #[test]
    fn value_paths_walk_objects_and_arrays() {
        let value = json!({"data": {"skills": [{"id": "sk1"}]}});
        assert_eq!(value_at_path(&value, "data.skills.0.id"), Some(&json!("sk1")));
        assert_eq!(value_at_path(&value, "data.missing"), None);
    }
}
