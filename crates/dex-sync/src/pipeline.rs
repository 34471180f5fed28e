use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dex_core::{Category, RunRecord, RunStamp};
use dex_stages::{LookupRegistry, Stage};
use dex_storage::{DocumentStore, HttpMirror, MirrorTransport, SourceFetcher};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::differ::{diff, PriorSnapshot};
use crate::report::{write_report, CategoryReport, RunFailure, SyncReport};
use crate::resolver::{DependencyGraph, ResolveError};
use crate::revision::resolve_revision;
use crate::runner::StageRunner;
use crate::validation::{validate, SchemaSet, ValidationPolicy};
use crate::versioning::stamp;
use crate::writer::SyncWriter;
use crate::SyncError;

/// Caller-supplied parameters for one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Empty means every category.
    pub categories: Vec<String>,
    pub epoch: Option<i64>,
    pub revision: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub report: SyncReport,
    pub report_path: PathBuf,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    stages: Vec<Box<dyn Stage>>,
    graph: DependencyGraph,
    runner: StageRunner,
    writer: SyncWriter,
    schemas: SchemaSet,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn DocumentStore>) -> anyhow::Result<Self> {
        let transport = Arc::new(HttpMirror::new(config.http_client())?);
        Self::with_transport(config, store, transport)
    }

    pub fn with_transport(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn MirrorTransport>,
    ) -> anyhow::Result<Self> {
        Self::with_stages(config, store, transport, dex_stages::catalog())
    }

    pub fn with_stages(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn MirrorTransport>,
        stages: Vec<Box<dyn Stage>>,
    ) -> anyhow::Result<Self> {
        let graph = DependencyGraph::from_stages(&stages)?;
        let schemas = SchemaSet::load_dir(&config.schema_dir)?;
        let primary = SourceFetcher::new(
            Some(config.data_dir.clone()),
            config.mirrors.clone(),
            transport.clone(),
            config.backoff(),
        );
        let secondary = SourceFetcher::new(None, config.secondary_mirrors.clone(), transport, config.backoff());
        let runner = StageRunner::new(primary, secondary, config.fetch_concurrency);
        let writer = SyncWriter::new(store.clone(), config.commit);
        Ok(Self {
            config,
            store,
            stages,
            graph,
            runner,
            writer,
            schemas,
        })
    }

    pub fn with_schemas(mut self, schemas: SchemaSet) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Resolved execution order for `requested`, without fetching anything.
    pub fn plan(&self, requested: &[String]) -> Result<Vec<String>, ResolveError> {
        self.graph.resolve(requested)
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let order = self.graph.resolve(&options.categories)?;
        let epoch = self.next_epoch(options.epoch).await?;
        let revision = resolve_revision(options.revision.as_deref(), &self.config.data_dir);
        let run = RunStamp::now(epoch, revision.clone());
        info!(
            %run_id,
            epoch,
            %revision,
            commit = self.writer.commits(),
            categories = order.len(),
            "starting sync run"
        );

        let mut report = SyncReport {
            run_id,
            epoch,
            revision: revision.clone(),
            committed: self.writer.commits(),
            started_at,
            finished_at: started_at,
            categories: Vec::with_capacity(order.len()),
            failure: None,
        };
        let mut registry = LookupRegistry::new();
        for name in &order {
            let stage = self
                .stages
                .iter()
                .find(|s| s.category() == name)
                .ok_or_else(|| ResolveError::UnknownCategory(name.clone()))?;
            let span = info_span!("category", %run_id, category = %name);
            match self
                .sync_category(stage.as_ref(), &mut registry, &run)
                .instrument(span)
                .await
            {
                Ok(category) => report.categories.push(category),
                Err(err) => {
                    self.write_partial_report(&mut report, &err).await;
                    return Err(err);
                }
            }
        }

        if self.writer.commits() {
            self.store
                .record_run(&RunRecord {
                    epoch,
                    revision: revision.clone(),
                    message: options.message.clone(),
                    date: run.date,
                })
                .await
                .map_err(SyncError::Ledger)?;
        }

        report.finished_at = Utc::now();
        let report_path = write_report(&self.config.reports_dir, &report)
            .await
            .map_err(|source| SyncError::Report {
                path: self.config.reports_dir.clone(),
                source,
            })?;
        info!(
            %run_id,
            changed = report.changed(),
            written = report.written(),
            report = %report_path.display(),
            "sync run finished"
        );
        Ok(SyncRunSummary { report, report_path })
    }

    /// An explicit epoch must be past the latest recorded run.
    async fn next_epoch(&self, explicit: Option<i64>) -> Result<i64, SyncError> {
        let latest = self
            .store
            .latest_run()
            .await
            .map_err(SyncError::Ledger)?
            .map(|run| run.epoch);
        match (explicit, latest) {
            (Some(requested), Some(latest)) if requested <= latest => {
                Err(SyncError::StaleEpoch { requested, latest })
            }
            (Some(requested), _) => Ok(requested),
            (None, latest) => Ok(latest.map_or(1, |epoch| epoch + 1)),
        }
    }

    /// Records the categories finished before `err`; the run's own error wins
    /// over any failure to write the report.
    async fn write_partial_report(&self, report: &mut SyncReport, err: &SyncError) {
        report.finished_at = Utc::now();
        report.failure = Some(RunFailure::from_error(err));
        match write_report(&self.config.reports_dir, report).await {
            Ok(path) => warn!(
                run_id = %report.run_id,
                error = %err,
                report = %path.display(),
                "sync run failed; partial report written"
            ),
            Err(source) => warn!(
                run_id = %report.run_id,
                error = %source,
                "could not write partial sync report"
            ),
        }
    }

    async fn sync_category(
        &self,
        stage: &dyn Stage,
        registry: &mut LookupRegistry,
        run: &RunStamp,
    ) -> Result<CategoryReport, SyncError> {
        let category = Category::from(stage.category());
        let store_err = |source| SyncError::Store {
            category: category.to_string(),
            source,
        };

        let output = self.runner.run(stage, registry).await?;
        let prior = PriorSnapshot::new(self.store.fetch_headers(&category).await.map_err(store_err)?);
        let outcome = diff(&category, output.documents, &prior);
        info!("found {}/{}", outcome.found, prior.len());
        info!("{} new docs", outcome.new);
        info!("{}/{} updated docs", outcome.updated, prior.len());

        let documents = stamp(outcome.changed, &prior, run);
        let validation = validate(self.schemas.get(category.as_str()), &documents);
        match (&validation.failure, self.config.validation) {
            (Some(failure), ValidationPolicy::Blocking) => {
                return Err(SyncError::Validation {
                    category: category.to_string(),
                    canon: failure.canon.clone(),
                    detail: failure.detail.clone(),
                });
            }
            (Some(failure), ValidationPolicy::Advisory) => {
                warn!(canon = %failure.canon, detail = %failure.detail, "schema error");
            }
            (None, _) if validation.checked => info!("schema validated"),
            (None, _) => {}
        }

        let written = self.writer.sync(&category, &documents).await.map_err(store_err)?;
        info!("finished");

        Ok(CategoryReport {
            category: category.to_string(),
            artifacts: output.artifacts,
            retries: output.retries,
            found: outcome.found,
            prior: prior.len(),
            new: outcome.new,
            updated: outcome.updated,
            unchanged: outcome.unchanged,
            duplicates: outcome.duplicates,
            keyless: outcome.keyless,
            validated: validation.checked,
            validation: validation.failure,
            written: written.inserted,
        })
    }
}
