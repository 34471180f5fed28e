use dex_core::{DocumentMeta, PersistedDocument, RunStamp};

use crate::differ::{ChangedDocument, PriorSnapshot};

/// Carries `created`/`createdIndex` forward from the prior document of the same
/// canon; `updated`, `updatedIndex` and `date` always take the current run.
pub fn stamp(changed: Vec<ChangedDocument>, prior: &PriorSnapshot, run: &RunStamp) -> Vec<PersistedDocument> {
    changed
        .into_iter()
        .map(|doc| {
            let (created, created_index) = match prior.get(&doc.canon) {
                Some(previous) => (previous.meta.created.clone(), previous.meta.created_index),
                None => (run.revision.clone(), run.epoch),
            };
            PersistedDocument {
                meta: DocumentMeta {
                    hash: doc.hash,
                    created,
                    updated: run.revision.clone(),
                    created_index,
                    updated_index: run.epoch,
                    date: run.date,
                },
                canon: doc.canon,
                keys: doc.keys,
                value: doc.value,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dex_core::DocumentHeader;
    use serde_json::json;

    fn changed(canon: &str) -> ChangedDocument {
        ChangedDocument {
            canon: canon.into(),
            keys: vec![canon.to_lowercase()],
            value: json!({}),
            hash: "h2".into(),
            is_new: false,
        }
    }

    #[test]
    fn first_observation_takes_the_current_run() {
        let docs = stamp(vec![changed("a1")], &PriorSnapshot::default(), &RunStamp::new(1, "r1", 100));
        assert_eq!(docs[0].meta.created, "r1");
        assert_eq!(docs[0].meta.created_index, 1);
        assert_eq!(docs[0].meta.updated_index, 1);
        assert_eq!(docs[0].meta.date, 100);
    }

    #[test]
    fn created_is_carried_forward() {
        let prior = PriorSnapshot::new(vec![DocumentHeader {
            canon: "a1".into(),
            keys: vec!["a1".into()],
            meta: DocumentMeta {
                hash: "h1".into(),
                created: "r1".into(),
                updated: "r2".into(),
                created_index: 1,
                updated_index: 2,
                date: 50,
            },
        }]);
        let docs = stamp(vec![changed("a1")], &prior, &RunStamp::new(3, "r3", 300));
        let meta = &docs[0].meta;
        assert_eq!((meta.created.as_str(), meta.created_index), ("r1", 1));
        assert_eq!((meta.updated.as_str(), meta.updated_index), ("r3", 3));
        assert_eq!(meta.hash, "h2");
        assert!(meta.created_index <= meta.updated_index);
    }
}
