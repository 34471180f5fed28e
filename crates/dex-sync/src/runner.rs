use dex_core::PreDocument;
use dex_stages::{ArtifactRef, ArtifactSet, Locale, LookupRegistry, Stage};
use dex_storage::{FetchError, SourceFetcher};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::SyncError;

/// What one stage handed back after its artifacts were fetched and extracted.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub documents: Vec<PreDocument>,
    pub artifacts: usize,
    pub retries: u32,
}

/// Fetches a stage's artifacts in bounded batches, extracts, and publishes the
/// stage's registry entry. The registry is only ever written here.
#[derive(Debug, Clone)]
pub struct StageRunner {
    primary: SourceFetcher,
    secondary: SourceFetcher,
    concurrency: usize,
}

impl StageRunner {
    pub fn new(primary: SourceFetcher, secondary: SourceFetcher, concurrency: usize) -> Self {
        Self {
            primary,
            secondary,
            concurrency: concurrency.max(1),
        }
    }

    fn fetcher(&self, locale: Locale) -> &SourceFetcher {
        match locale {
            Locale::Primary => &self.primary,
            Locale::Secondary => &self.secondary,
        }
    }

    pub async fn run(&self, stage: &dyn Stage, registry: &mut LookupRegistry) -> Result<StageOutput, SyncError> {
        let category = stage.category();
        let stage_err = |source| SyncError::Stage {
            category: category.to_string(),
            source,
        };

        let mut artifacts = ArtifactSet::new();
        let mut retries = self
            .fetch_into(&mut artifacts, stage.artifacts())
            .await
            .map_err(|source| SyncError::Fetch {
                category: category.to_string(),
                source,
            })?;

        let follow_ups = stage.follow_ups(&artifacts, registry).map_err(stage_err)?;
        if !follow_ups.is_empty() {
            debug!(category, count = follow_ups.len(), "fetching follow-up artifacts");
            retries += self
                .fetch_into(&mut artifacts, follow_ups)
                .await
                .map_err(|source| SyncError::Fetch {
                    category: category.to_string(),
                    source,
                })?;
        }

        let extraction = stage.extract(&artifacts, registry).map_err(stage_err)?;
        if let Some(update) = extraction.registry {
            debug!(category, entries = update.len(), "publishing lookup entries");
            registry.publish(category, update).map_err(stage_err)?;
        }

        Ok(StageOutput {
            documents: extraction.documents,
            artifacts: artifacts.len(),
            retries,
        })
    }

    /// Every fetch in a batch settles before the batch's first error surfaces.
    async fn fetch_into(&self, set: &mut ArtifactSet, wanted: Vec<ArtifactRef>) -> Result<u32, FetchError> {
        let mut pending = Vec::with_capacity(wanted.len());
        for artifact in wanted {
            if !set.contains(&artifact) && !pending.contains(&artifact) {
                pending.push(artifact);
            }
        }

        let mut retries = 0;
        for batch in pending.chunks(self.concurrency) {
            let results = join_all(batch.iter().map(|artifact| async move {
                let fetched = self.fetcher(artifact.locale).fetch(&artifact.path).await;
                (artifact, fetched)
            }))
            .await;

            let mut first_error = None;
            for (artifact, fetched) in results {
                match fetched {
                    Ok(raw) => {
                        retries += raw.retries;
                        set.insert(artifact.clone(), raw.value);
                    }
                    Err(err) if first_error.is_none() => first_error = Some(err),
                    Err(err) => warn!(%artifact, %err, "additional fetch failure in batch"),
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        Ok(retries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use dex_stages::{Extraction, StageError};
    use dex_storage::{AttemptOutcome, BackoffPolicy, MirrorTransport};

    use super::*;

    const MIRROR: &str = "https://mirror.test";

    /// Counts concurrent requests; `slow` paths take longer and `missing`
    /// paths are refused.
    #[derive(Default)]
    struct TrackingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        requested: Mutex<Vec<String>>,
        completed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MirrorTransport for TrackingTransport {
        async fn get(&self, url: &str) -> AttemptOutcome {
            self.requested.lock().unwrap().push(url.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = if url.contains("slow") { 40 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.lock().unwrap().push(url.to_string());
            if url.contains("missing") {
                AttemptOutcome::Permanent("http status 403".into())
            } else {
                AttemptOutcome::Ok(b"{}".to_vec())
            }
        }
    }

    struct ListStage(Vec<String>);

    impl Stage for ListStage {
        fn category(&self) -> &'static str {
            "list"
        }

        fn artifacts(&self) -> Vec<ArtifactRef> {
            self.0.iter().cloned().map(ArtifactRef::primary).collect()
        }

        fn extract(&self, _artifacts: &ArtifactSet, _registry: &LookupRegistry) -> Result<Extraction, StageError> {
            Ok(Extraction {
                documents: Vec::new(),
                registry: None,
            })
        }
    }

    fn runner(transport: Arc<TrackingTransport>, concurrency: usize) -> StageRunner {
        let backoff = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let primary = SourceFetcher::new(None, vec![MIRROR.into()], transport.clone(), backoff);
        let secondary = SourceFetcher::new(None, Vec::new(), transport, backoff);
        StageRunner::new(primary, secondary, concurrency)
    }

    #[tokio::test]
    async fn fetches_never_exceed_the_concurrency_limit() {
        let transport = Arc::new(TrackingTransport::default());
        let stage = ListStage((0..10).map(|i| format!("table_{i}.json")).collect());

        let output = runner(transport.clone(), 4)
            .run(&stage, &mut LookupRegistry::new())
            .await
            .unwrap();
        assert_eq!(output.artifacts, 10);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 4);
        assert_eq!(transport.completed.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn failed_fetch_lets_its_batch_finish_and_skips_later_batches() {
        let transport = Arc::new(TrackingTransport::default());
        let stage = ListStage(
            ["missing-a.json", "slow.json", "missing-b.json", "later.json"]
                .map(String::from)
                .to_vec(),
        );

        let err = runner(transport.clone(), 3)
            .run(&stage, &mut LookupRegistry::new())
            .await
            .unwrap_err();
        match &err {
            SyncError::Fetch { category, source } => {
                assert_eq!(category, "list");
                assert_eq!(source.path(), "missing-a.json");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let completed = transport.completed.lock().unwrap();
        assert!(completed.contains(&format!("{MIRROR}/slow.json")));
        let requested = transport.requested.lock().unwrap();
        assert_eq!(requested.len(), 3);
        assert!(!requested.contains(&format!("{MIRROR}/later.json")));
    }
}
